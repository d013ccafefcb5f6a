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

//! Partial decoding of SCALE-encoded block headers.
//!
//! A block header starts with the hash of the parent block, the block number, the state trie
//! root and the extrinsics trie root, followed by the digest. Only the first four fields are
//! decoded here; the digest is left as an opaque list of bytes, as its content depends on the
//! consensus engine of the chain.
//!
//! The hash of a block is the BLAKE2b-256 hash of its SCALE-encoded header. See
//! [`hash_from_scale_encoded_header`].

use crate::util;

use alloc::vec::Vec;

/// Returns the hash of a SCALE-encoded header.
///
/// Does not verify the validity of the header.
pub fn hash_from_scale_encoded_header(header: impl AsRef<[u8]>) -> [u8; 32] {
    util::blake2_256(header.as_ref())
}

/// Header of a block, after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRef<'a> {
    /// Hash of the parent block stored in the header.
    pub parent_hash: &'a [u8; 32],
    /// Block number stored in the header.
    pub number: u64,
    /// The state trie Merkle root.
    pub state_root: &'a [u8; 32],
    /// The Merkle root of the extrinsics.
    pub extrinsics_root: &'a [u8; 32],
    /// SCALE-encoded list of digest items, including the length prefix.
    pub digest: &'a [u8],
}

impl<'a> HeaderRef<'a> {
    /// Builds the SCALE encoding of this header.
    pub fn scale_encoding_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * 3 + 8 + self.digest.len());
        out.extend_from_slice(self.parent_hash);
        out.extend_from_slice(&util::encode_scale_compact_u64(self.number));
        out.extend_from_slice(self.state_root);
        out.extend_from_slice(self.extrinsics_root);
        out.extend_from_slice(self.digest);
        out
    }

    /// Returns the hash of the header.
    pub fn hash(&self) -> [u8; 32] {
        hash_from_scale_encoded_header(self.scale_encoding_vec())
    }
}

/// Attempt to decode the given SCALE-encoded header.
///
/// The block number is encoded as a SCALE-compact integer, which doesn't depend on the size of
/// the block number type of the chain.
pub fn decode(scale_encoded: &[u8]) -> Result<HeaderRef, Error> {
    let (digest, (parent_hash, number, state_root, extrinsics_root)) =
        match header_prefix(scale_encoded) {
            Ok(v) => v,
            Err(nom::Err::Incomplete(_)) => return Err(Error::TooShort),
            Err(nom::Err::Error(_) | nom::Err::Failure(_)) => return Err(Error::BlockNumberOverflow),
        };

    // The digest starts with its number of items. Check that at least this prefix is present.
    if util::nom_scale_compact_usize(digest).is_err() {
        return Err(Error::DigestMissing);
    }

    Ok(HeaderRef {
        parent_hash,
        number,
        state_root,
        extrinsics_root,
        digest,
    })
}

/// Potential error when decoding a header.
#[derive(Debug, derive_more::Display, derive_more::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Header is too short to contain the hashes and block number.
    #[display("Header is too short")]
    TooShort,
    /// Block number doesn't fit in 64 bits.
    #[display("Block number is too large")]
    BlockNumberOverflow,
    /// Header doesn't contain a digest.
    #[display("Header doesn't contain a digest")]
    DigestMissing,
}

fn header_prefix(
    bytes: &[u8],
) -> nom::IResult<&[u8], (&[u8; 32], u64, &[u8; 32], &[u8; 32])> {
    let (bytes, parent_hash) = hash32(bytes)?;
    let (bytes, number) = util::nom_scale_compact_u64(bytes)?;
    let (bytes, state_root) = hash32(bytes)?;
    let (bytes, extrinsics_root) = hash32(bytes)?;
    Ok((bytes, (parent_hash, number, state_root, extrinsics_root)))
}

fn hash32(bytes: &[u8]) -> nom::IResult<&[u8], &[u8; 32]> {
    let (rest, hash) = nom::bytes::streaming::take(32u32)(bytes)?;
    // `take(32)` guarantees the length.
    let hash = <&[u8; 32]>::try_from(hash).unwrap_or_else(|_| unreachable!());
    Ok((rest, hash))
}
