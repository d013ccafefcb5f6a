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

//! Helpers to print values in logs.

use core::fmt;

/// Implements `fmt::Display` for a hash, printing it as `0x` followed by its hexadecimal
/// representation.
///
/// When using the alternate formatting (`{:#}`), only the first and last bytes are printed.
pub struct HashDisplay<'a>(pub &'a [u8]);

impl<'a> fmt::Display for HashDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() && self.0.len() >= 4 {
            write!(
                f,
                "0x{}…{}",
                hex::encode(&self.0[..2]),
                hex::encode(&self.0[self.0.len() - 2..])
            )
        } else {
            write!(f, "0x{}", hex::encode(self.0))
        }
    }
}

impl<'a> fmt::Debug for HashDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Implements `fmt::Display` for a number of bytes.
pub struct BytesDisplay(pub u64);

impl fmt::Display for BytesDisplay {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut value = self.0 as f64;

        if value < 1000.0 {
            return write!(f, "{} B", value);
        }
        value /= 1024.0;

        if value < 100.0 {
            return write!(f, "{:.1} kiB", value);
        }
        if value < 1000.0 {
            return write!(f, "{:.0} kiB", value);
        }
        value /= 1024.0;

        if value < 100.0 {
            return write!(f, "{:.1} MiB", value);
        }
        write!(f, "{:.0} MiB", value)
    }
}

#[cfg(test)]
mod tests {
    use alloc::format;

    #[test]
    fn hash_display() {
        let hash = [0xab; 32];
        assert_eq!(
            format!("{}", super::HashDisplay(&hash)),
            format!("0x{}", "ab".repeat(32))
        );
        assert_eq!(format!("{:#}", super::HashDisplay(&hash)), "0xabab…abab");
    }

    #[test]
    fn bytes_display() {
        assert_eq!(format!("{}", super::BytesDisplay(12)), "12 B");
        assert_eq!(format!("{}", super::BytesDisplay(2048)), "2.0 kiB");
    }
}
