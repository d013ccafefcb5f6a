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

//! Queue of storage reads ("pulls") waiting to be started.
//!
//! Pulls are executed one at a time. The queue only contains the pulls that haven't started yet.
//! When the number of queued pulls reaches the collapse threshold (3 by default), all of them
//! except for the newest one are discarded.

use alloc::collections::VecDeque;

/// Default number of queued pulls at which the queue collapses.
pub const DEFAULT_COLLAPSE_THRESHOLD: usize = 3;

/// See [the module-level documentation](..).
#[derive(Debug, Clone)]
pub struct PullQueue<T> {
    queue: VecDeque<T>,
    collapse_threshold: usize,
    num_dropped: u64,
}

impl<T> PullQueue<T> {
    /// Creates a new empty queue with the default collapse threshold.
    pub fn new() -> Self {
        Self::with_collapse_threshold(DEFAULT_COLLAPSE_THRESHOLD)
    }

    /// Creates a new empty queue that collapses once it contains `threshold` pulls.
    ///
    /// # Panic
    ///
    /// Panics if `threshold` is 0.
    ///
    pub fn with_collapse_threshold(threshold: usize) -> Self {
        assert_ne!(threshold, 0);
        PullQueue {
            queue: VecDeque::with_capacity(threshold),
            collapse_threshold: threshold,
            num_dropped: 0,
        }
    }

    /// Adds a pull at the back of the queue.
    ///
    /// Returns the number of pulls that have been discarded as a result.
    pub fn push(&mut self, pull: T) -> usize {
        self.queue.push_back(pull);
        if self.queue.len() < self.collapse_threshold {
            return 0;
        }

        let dropped = self.queue.len() - 1;
        self.queue.drain(..dropped);
        self.num_dropped += u64::try_from(dropped).unwrap_or(u64::MAX);
        dropped
    }

    /// Removes the oldest pull from the queue, in order to start it.
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    /// Discards all the pulls in the queue.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Returns the number of pulls waiting to be started.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no pull is waiting to be started.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the total number of pulls that have been discarded since the queue was created.
    pub fn num_dropped(&self) -> u64 {
        self.num_dropped
    }
}

impl<T> Default for PullQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
