// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error types for query, replay and configuration paths.
//!
//! The capture path never returns these: capture failures are reflected in
//! counters only.

use crate::event::EventId;
use crate::replay::{InvalidTransition, SessionId};
use thiserror::Error;

/// Result type for timetravel operations
pub type Result<T> = std::result::Result<T, TimeTravelError>;

/// Errors surfaced to query and replay callers
#[derive(Debug, Error)]
pub enum TimeTravelError {
    /// No resident flow for this correlation id
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Event was never captured or has been evicted
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// Unknown or already reclaimed replay session
    #[error("Replay session not found: {0}")]
    SessionNotFound(SessionId),

    /// Replay finished but some events were evicted before they could be read
    #[error("Replay {session} skipped {skipped} evicted events")]
    ReplayGap { session: SessionId, skipped: u64 },

    /// Replay speed must be a positive, finite multiplier
    #[error("Invalid replay speed: {0}")]
    InvalidSpeed(f64),

    /// Replay range with start after end
    #[error("Invalid time range: start {start_us} is after end {end_us}")]
    InvalidRange { start_us: u64, end_us: u64 },

    /// Session state machine rejected the request
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration file error: {0}")]
    ConfigFile(String),
}

impl From<std::io::Error> for TimeTravelError {
    fn from(e: std::io::Error) -> Self {
        TimeTravelError::ConfigFile(e.to_string())
    }
}

impl From<toml::de::Error> for TimeTravelError {
    fn from(e: toml::de::Error) -> Self {
        TimeTravelError::ConfigFile(e.to_string())
    }
}
