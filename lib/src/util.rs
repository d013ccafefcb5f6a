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

//! Miscellaneous SCALE-related helpers shared by the modules of this crate.

use alloc::vec::Vec;

/// Decodes a SCALE-compact-encoded integer.
///
/// Fails if the value doesn't fit in a `u64`.
pub(crate) fn nom_scale_compact_u64(bytes: &[u8]) -> nom::IResult<&[u8], u64> {
    let (rest, first_byte) = nom::number::streaming::u8(bytes)?;

    match first_byte & 0b11 {
        0b00 => Ok((rest, u64::from(first_byte >> 2))),
        0b01 => {
            let (rest, second_byte) = nom::number::streaming::u8(rest)?;
            let value = (u64::from(second_byte) << 6) | u64::from(first_byte >> 2);
            Ok((rest, value))
        }
        0b10 => {
            let (rest, next) = nom::bytes::streaming::take(3u32)(rest)?;
            let value = u32::from_le_bytes([first_byte, next[0], next[1], next[2]]) >> 2;
            Ok((rest, u64::from(value)))
        }
        _ => {
            // Upper six bits indicate the number of bytes following, minus four.
            let num_bytes = usize::from(first_byte >> 2) + 4;
            if num_bytes > 8 {
                return Err(nom::Err::Failure(nom::error::make_error(
                    bytes,
                    nom::error::ErrorKind::TooLarge,
                )));
            }

            let (rest, value_bytes) = nom::bytes::streaming::take(num_bytes)(rest)?;
            let mut buf = [0u8; 8];
            buf[..num_bytes].copy_from_slice(value_bytes);
            Ok((rest, u64::from_le_bytes(buf)))
        }
    }
}

/// Same as [`nom_scale_compact_u64`], but for a `usize`.
pub(crate) fn nom_scale_compact_usize(bytes: &[u8]) -> nom::IResult<&[u8], usize> {
    let (rest, value) = nom_scale_compact_u64(bytes)?;
    match usize::try_from(value) {
        Ok(v) => Ok((rest, v)),
        Err(_) => Err(nom::Err::Failure(nom::error::make_error(
            bytes,
            nom::error::ErrorKind::TooLarge,
        ))),
    }
}

/// Decodes a SCALE-encoded boolean.
pub(crate) fn nom_bool_decode(bytes: &[u8]) -> nom::IResult<&[u8], bool> {
    let (rest, byte) = nom::number::streaming::u8(bytes)?;
    match byte {
        0 => Ok((rest, false)),
        1 => Ok((rest, true)),
        _ => Err(nom::Err::Failure(nom::error::make_error(
            bytes,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

/// Returns the SCALE-compact encoding of the given integer.
pub(crate) fn encode_scale_compact_u64(value: u64) -> Vec<u8> {
    if value < (1 << 6) {
        // `as` is fine here, as the value fits.
        Vec::from([(value as u8) << 2])
    } else if value < (1 << 14) {
        let encoded = ((value as u16) << 2) | 0b01;
        Vec::from(encoded.to_le_bytes())
    } else if value < (1 << 30) {
        let encoded = ((value as u32) << 2) | 0b10;
        Vec::from(encoded.to_le_bytes())
    } else {
        let bytes = value.to_le_bytes();
        let num_bytes = bytes.iter().rposition(|b| *b != 0).map_or(1, |n| n + 1);
        let num_bytes = num_bytes.max(4);
        let mut out = Vec::with_capacity(num_bytes + 1);
        out.push((((num_bytes - 4) as u8) << 2) | 0b11);
        out.extend_from_slice(&bytes[..num_bytes]);
        out
    }
}

/// Returns the BLAKE2b hash of the given data, with a 32 bytes output.
pub(crate) fn blake2_256(data: &[u8]) -> [u8; 32] {
    let mut out = [0; 32];
    out.copy_from_slice(blake2_rfc::blake2b::blake2b(32, &[], data).as_bytes());
    out
}
