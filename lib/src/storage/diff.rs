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

//! Value-level change detection of storage snapshots.

use alloc::vec::Vec;

/// Keeps the last snapshot delivered to a storage subscriber and decides whether a newly-read
/// snapshot must be delivered.
///
/// A snapshot is a list of values, one per subscribed key, in the order of the keys. The first
/// snapshot is always delivered. Afterwards, a snapshot is delivered only if at least one value
/// differs from the last delivered one, and the entire snapshot is delivered.
#[derive(Debug, Clone)]
pub struct ValuesTracker<T> {
    last_delivered: Option<Vec<T>>,
}

impl<T: PartialEq> ValuesTracker<T> {
    /// Creates a new tracker that hasn't delivered anything yet.
    pub fn new() -> Self {
        ValuesTracker {
            last_delivered: None,
        }
    }

    /// Injects a newly-read snapshot.
    ///
    /// Returns the snapshot if it must be delivered, in which case it becomes the last delivered
    /// snapshot. Returns `None` if nothing has changed.
    pub fn update(&mut self, snapshot: Vec<T>) -> Option<&[T]> {
        if self.last_delivered.as_ref() == Some(&snapshot) {
            return None;
        }

        self.last_delivered = Some(snapshot);
        self.last_delivered.as_deref()
    }

    /// Returns the last delivered snapshot, if any.
    pub fn last_delivered(&self) -> Option<&[T]> {
        self.last_delivered.as_deref()
    }
}

impl<T: PartialEq> Default for ValuesTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}
