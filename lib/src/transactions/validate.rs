// Smoldot
// Copyright (C) 2023  Pierre Krieger
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Runtime call to obtain the validity status of a transaction.
//!
//! Before broadcasting a transaction, it is validated against the runtime of the current best
//! block by calling the `TaggedTransactionQueue_validate_transaction` function. This module
//! builds the parameters of this call and decodes its return value.

use crate::util;

use alloc::{borrow::ToOwned as _, vec::Vec};
use core::num::NonZeroU64;

mod tests;

/// Name of the runtime function to call in order to validate a transaction.
pub const VALIDATION_FUNCTION_NAME: &str = "TaggedTransactionQueue_validate_transaction";

/// Source of the transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionSource {
    /// Transaction is already included in a block.
    InBlock,
    /// Transaction is coming from a local source, for instance an off-chain worker.
    Local,
    /// Transaction has been received externally, for instance through the JSON-RPC server.
    ///
    /// This is always the source of the transactions submitted by this client.
    External,
}

/// Information concerning a valid transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTransaction {
    /// Priority of the transaction. Transactions with a higher priority are included first.
    pub priority: u64,

    /// List of *tags* that must be provided by other transactions before this one can be
    /// included.
    pub requires: Vec<Vec<u8>>,

    /// List of *tags* provided by this transaction. Never empty.
    pub provides: Vec<Vec<u8>>,

    /// Number of blocks during which the transaction can be assumed to remain valid.
    pub longevity: NonZeroU64,

    /// If `false`, the transaction shouldn't be gossiped to the rest of the network.
    pub propagate: bool,
}

/// An invalid transaction validity.
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum InvalidTransaction {
    /// The call of the transaction is not expected.
    Call,
    /// Inability to pay some fees (e.g. account balance too low).
    Payment,
    /// The transaction is not yet valid (e.g. nonce too high).
    Future,
    /// The transaction is outdated (e.g. nonce too low).
    Stale,
    /// The transaction's proof (e.g. signature) is wrong.
    BadProof,
    /// The transaction birth block is ancient.
    AncientBirthBlock,
    /// The transaction would exhaust the resources of current block.
    ExhaustsResources,
    /// Any other custom invalid validity that is not covered by this enum.
    #[display("Other reason (code: {_0})")]
    Custom(u8),
    /// An extrinsic with a mandatory dispatch resulted in an error.
    BadMandatory,
    /// A transaction with a mandatory dispatch. Only inherents are allowed to have one.
    MandatoryDispatch,
    /// The sending address is disabled or known to be invalid.
    BadSigner,
}

/// An unknown transaction validity.
#[derive(Debug, derive_more::Display, Clone, PartialEq, Eq)]
pub enum UnknownTransaction {
    /// Could not lookup some information that is required to validate the transaction.
    CannotLookup,
    /// No validator found for the given unsigned transaction.
    NoUnsignedValidator,
    /// Any other custom unknown validity that is not covered by this enum.
    #[display("Other reason (code: {_0})")]
    Custom(u8),
}

/// Errors that can occur while checking the validity of a transaction.
#[derive(Debug, derive_more::Display, derive_more::Error, Clone, PartialEq, Eq)]
pub enum TransactionValidityError {
    /// The transaction is invalid.
    #[display("Invalid transaction: {_0}")]
    Invalid(#[error(not(source))] InvalidTransaction),
    /// Transaction validity can't be determined.
    #[display("Transaction validity couldn't be determined: {_0}")]
    Unknown(#[error(not(source))] UnknownTransaction),
}

/// Error that can happen during the decoding of the return value.
#[derive(Debug, derive_more::Display, derive_more::Error, Clone, PartialEq, Eq)]
#[display("Failed to decode the transaction validation return value")]
pub struct DecodeError;

/// Produces the input to pass to the `TaggedTransactionQueue_validate_transaction` runtime call,
/// for version 3 of the `TaggedTransactionQueue` runtime API.
///
/// The runtime function expects a SCALE-encoded `(source, tx, block_hash)`. The transaction is
/// expected to already be SCALE-encoded, and is copied as-is.
pub fn validate_transaction_runtime_parameters_v3(
    scale_encoded_transaction: &[u8],
    source: TransactionSource,
    block_hash: &[u8; 32],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + scale_encoded_transaction.len() + 32);
    out.push(match source {
        TransactionSource::InBlock => 0,
        TransactionSource::Local => 1,
        TransactionSource::External => 2,
    });
    out.extend_from_slice(scale_encoded_transaction);
    out.extend_from_slice(block_hash);
    out
}

/// Attempt to decode the return value of the `TaggedTransactionQueue_validate_transaction`
/// runtime call.
pub fn decode_validate_transaction_return_value(
    scale_encoded: &[u8],
) -> Result<Result<ValidTransaction, TransactionValidityError>, DecodeError> {
    match transaction_validity(scale_encoded) {
        Ok((rest, data)) if rest.is_empty() => Ok(data),
        Ok(_) | Err(_) => Err(DecodeError),
    }
}

fn transaction_validity(
    bytes: &[u8],
) -> nom::IResult<&[u8], Result<ValidTransaction, TransactionValidityError>> {
    let (bytes, discriminant) = nom::number::streaming::u8(bytes)?;
    match discriminant {
        0 => {
            let (bytes, valid) = valid_transaction(bytes)?;
            Ok((bytes, Ok(valid)))
        }
        1 => {
            let (bytes, error) = transaction_validity_error(bytes)?;
            Ok((bytes, Err(error)))
        }
        _ => Err(invalid_tag(bytes)),
    }
}

fn valid_transaction(bytes: &[u8]) -> nom::IResult<&[u8], ValidTransaction> {
    let (bytes, priority) = nom::number::streaming::le_u64(bytes)?;
    let (bytes, requires) = tags(bytes)?;
    let (bytes, provides) = tags(bytes)?;
    if provides.is_empty() {
        return Err(invalid_tag(bytes));
    }
    let (bytes, longevity) = nom::number::streaming::le_u64(bytes)?;
    let Some(longevity) = NonZeroU64::new(longevity) else {
        return Err(invalid_tag(bytes));
    };
    let (bytes, propagate) = util::nom_bool_decode(bytes)?;

    Ok((
        bytes,
        ValidTransaction {
            priority,
            requires,
            provides,
            longevity,
            propagate,
        },
    ))
}

fn transaction_validity_error(bytes: &[u8]) -> nom::IResult<&[u8], TransactionValidityError> {
    let (bytes, discriminant) = nom::number::streaming::u8(bytes)?;
    match discriminant {
        0 => {
            let (bytes, invalid) = invalid_transaction(bytes)?;
            Ok((bytes, TransactionValidityError::Invalid(invalid)))
        }
        1 => {
            let (bytes, unknown) = unknown_transaction(bytes)?;
            Ok((bytes, TransactionValidityError::Unknown(unknown)))
        }
        _ => Err(invalid_tag(bytes)),
    }
}

fn invalid_transaction(bytes: &[u8]) -> nom::IResult<&[u8], InvalidTransaction> {
    let (bytes, discriminant) = nom::number::streaming::u8(bytes)?;
    let invalid = match discriminant {
        0 => InvalidTransaction::Call,
        1 => InvalidTransaction::Payment,
        2 => InvalidTransaction::Future,
        3 => InvalidTransaction::Stale,
        4 => InvalidTransaction::BadProof,
        5 => InvalidTransaction::AncientBirthBlock,
        6 => InvalidTransaction::ExhaustsResources,
        7 => {
            let (bytes, code) = nom::number::streaming::u8(bytes)?;
            return Ok((bytes, InvalidTransaction::Custom(code)));
        }
        8 => InvalidTransaction::BadMandatory,
        9 => InvalidTransaction::MandatoryDispatch,
        10 => InvalidTransaction::BadSigner,
        _ => return Err(invalid_tag(bytes)),
    };
    Ok((bytes, invalid))
}

fn unknown_transaction(bytes: &[u8]) -> nom::IResult<&[u8], UnknownTransaction> {
    let (bytes, discriminant) = nom::number::streaming::u8(bytes)?;
    match discriminant {
        0 => Ok((bytes, UnknownTransaction::CannotLookup)),
        1 => Ok((bytes, UnknownTransaction::NoUnsignedValidator)),
        2 => {
            let (bytes, code) = nom::number::streaming::u8(bytes)?;
            Ok((bytes, UnknownTransaction::Custom(code)))
        }
        _ => Err(invalid_tag(bytes)),
    }
}

fn tags(bytes: &[u8]) -> nom::IResult<&[u8], Vec<Vec<u8>>> {
    let (mut bytes, num_elems) = util::nom_scale_compact_usize(bytes)?;
    // The capacity is bounded by the input length, in order to not trust the length prefix.
    let mut out = Vec::with_capacity(num_elems.min(bytes.len()));
    for _ in 0..num_elems {
        let (rest, len) = util::nom_scale_compact_usize(bytes)?;
        let (rest, tag) = nom::bytes::streaming::take(len)(rest)?;
        out.push(tag.to_owned());
        bytes = rest;
    }
    Ok((bytes, out))
}

fn invalid_tag(bytes: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Failure(nom::error::make_error(bytes, nom::error::ErrorKind::Tag))
}
