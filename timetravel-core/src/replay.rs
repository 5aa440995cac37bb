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

//! Replay session model and lifecycle state machine.
//!
//! ```text
//! Pending --Advance/Resume--> Running --Pause--> Paused --Resume--> Running
//!    |                          |                  |
//!    +--------Cancel/Expire-----+------------------+--> Cancelled
//!                               |
//!                               +--Exhaust--> Completed | FailedWithGap
//! ```
//!
//! Terminal states accept no further commands.

use crate::error::{Result, TimeTravelError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Replay session identifier
pub type SessionId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// All flows interleaved by timestamp
    System,
    /// One flow in per-flow sequence order
    Flow,
}

/// What a session replays, fixed at start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayScope {
    TimeRange { start_us: u64, end_us: u64 },
    Flow { correlation_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    FailedWithGap,
}

impl ReplayStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReplayStatus::Completed | ReplayStatus::Cancelled | ReplayStatus::FailedWithGap
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCommand {
    Advance,
    Pause,
    Resume,
    Cancel,
    /// Last event of the scope was delivered; `gap` if any were skipped
    Exhaust { gap: bool },
    /// Idle timeout elapsed
    Expire,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid replay transition: {current:?} -> {command:?}")]
pub struct InvalidTransition {
    pub current: ReplayStatus,
    pub command: ReplayCommand,
}

impl ReplayStatus {
    pub fn transition(
        self,
        command: ReplayCommand,
    ) -> std::result::Result<ReplayStatus, InvalidTransition> {
        use ReplayCommand::*;
        use ReplayStatus::*;

        let next = match (self, command) {
            (Pending | Running, Advance) => Running,
            (Pending | Running | Paused, Pause) => Paused,
            (Pending | Running | Paused, Resume) => Running,
            (s, Cancel | Expire) if !s.is_terminal() => Cancelled,
            (Pending | Running, Exhaust { gap: false }) => Completed,
            (Pending | Running, Exhaust { gap: true }) => FailedWithGap,
            _ => {
                return Err(InvalidTransition {
                    current: self,
                    command,
                })
            }
        };

        Ok(next)
    }
}

/// Point-in-time view of a replay session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySnapshot {
    pub id: SessionId,
    pub mode: ReplayMode,
    pub scope: ReplayScope,
    pub speed: f64,
    pub status: ReplayStatus,
    /// Events in scope when the session started
    pub total: u64,
    pub delivered: u64,
    /// Events evicted before they could be delivered
    pub skipped: u64,
    /// Scope entries consumed so far, delivered or skipped
    pub position: u64,
}

impl ReplaySnapshot {
    /// Events neither delivered nor skipped yet
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.delivered + self.skipped)
    }

    /// Fraction of the scope processed, 1.0 for an empty scope
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.delivered + self.skipped) as f64 / self.total as f64
        }
    }

    /// Turn a gap into an error for callers that need a complete replay
    pub fn ensure_complete(&self) -> Result<()> {
        if self.status == ReplayStatus::FailedWithGap || self.skipped > 0 {
            return Err(TimeTravelError::ReplayGap {
                session: self.id,
                skipped: self.skipped,
            });
        }
        Ok(())
    }
}
