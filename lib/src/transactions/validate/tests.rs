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

#![cfg(test)]

use super::{
    decode_validate_transaction_return_value, validate_transaction_runtime_parameters_v3,
    InvalidTransaction, TransactionSource, TransactionValidityError, UnknownTransaction,
};

#[test]
fn parameters_layout() {
    let params =
        validate_transaction_runtime_parameters_v3(&[8, 1, 2], TransactionSource::External, &[7; 32]);
    assert_eq!(params[0], 2);
    assert_eq!(&params[1..4], &[8, 1, 2]);
    assert_eq!(&params[4..], &[7; 32]);
}

#[test]
fn decode_valid() {
    let mut encoded = vec![0];
    encoded.extend_from_slice(&5u64.to_le_bytes());
    // `requires`: no tag.
    encoded.push(0);
    // `provides`: one tag of two bytes.
    encoded.extend_from_slice(&[0b100, 0b1000, 0xaa, 0xbb]);
    encoded.extend_from_slice(&64u64.to_le_bytes());
    encoded.push(1);

    let valid = decode_validate_transaction_return_value(&encoded)
        .unwrap()
        .unwrap();
    assert_eq!(valid.priority, 5);
    assert!(valid.requires.is_empty());
    assert_eq!(valid.provides, vec![vec![0xaa, 0xbb]]);
    assert_eq!(valid.longevity.get(), 64);
    assert!(valid.propagate);
}

#[test]
fn decode_invalid() {
    assert_eq!(
        decode_validate_transaction_return_value(&[1, 0, 4]).unwrap(),
        Err(TransactionValidityError::Invalid(InvalidTransaction::BadProof))
    );
    assert_eq!(
        decode_validate_transaction_return_value(&[1, 0, 7, 42]).unwrap(),
        Err(TransactionValidityError::Invalid(InvalidTransaction::Custom(42)))
    );
    assert_eq!(
        decode_validate_transaction_return_value(&[1, 1, 1]).unwrap(),
        Err(TransactionValidityError::Unknown(
            UnknownTransaction::NoUnsignedValidator
        ))
    );
}

#[test]
fn decode_rejects_garbage() {
    assert!(decode_validate_transaction_return_value(&[]).is_err());
    assert!(decode_validate_transaction_return_value(&[2]).is_err());
    // Trailing data.
    assert!(decode_validate_transaction_return_value(&[1, 0, 4, 0]).is_err());
}

#[test]
fn decode_rejects_empty_provides() {
    let mut encoded = vec![0];
    encoded.extend_from_slice(&5u64.to_le_bytes());
    encoded.extend_from_slice(&[0, 0]);
    encoded.extend_from_slice(&64u64.to_le_bytes());
    encoded.push(1);
    assert!(decode_validate_transaction_return_value(&encoded).is_err());
}
