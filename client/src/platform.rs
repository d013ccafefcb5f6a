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

//! Access to the capabilities of the environment the client runs in.
//!
//! All the services of this crate are background tasks that are spawned through the
//! [`PlatformRef`] trait. The timers and the logs go through this trait as well, so
//! that the client can be embedded in environments where the operating system isn't directly
//! accessible.

use alloc::borrow::Cow;
use core::{fmt, future::Future, time::Duration};

#[cfg(feature = "std")]
pub use default::DefaultPlatform;

mod default;

/// Access to a platform's capabilities.
///
/// Implementations of this trait are expected to be cheap to clone, as the services clone it
/// freely. An `Arc` is typically used.
pub trait PlatformRef: Clone + Send + Sync + 'static {
    type Delay: Future<Output = ()> + Send + 'static;

    /// Creates a future that becomes ready after at least the given duration has elapsed.
    fn sleep(&self, duration: Duration) -> Self::Delay;

    /// Spawns a task that runs in the background until it finishes.
    ///
    /// The task name is meant to be used for debugging purposes only.
    fn spawn_task(&self, task_name: Cow<str>, task: impl Future<Output = ()> + Send + 'static);

    /// Emits a log line.
    ///
    /// `key_values` contains the structured parameters of the log line, in the order in which
    /// they have been passed to the [`log!`](crate::log!) macro.
    fn log(
        &self,
        log_level: LogLevel,
        log_target: &str,
        message: &str,
        key_values: &[(&str, &dyn fmt::Display)],
    );
}

/// Log level of a log line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}
