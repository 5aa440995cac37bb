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

//! Updates pushed to live subscribers.

use serde::{Deserialize, Serialize};
use timetravel_core::{FlowSummary, ReplaySnapshot, StatsSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Update {
    /// A flow gained an event
    FlowUpdated(FlowSummary),
    /// Periodic statistics heartbeat
    Stats(StatsSnapshot),
    /// Replay session status or progress changed
    ReplayProgress(ReplaySnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Flow,
    Stats,
    Replay,
}

impl Update {
    pub fn kind(&self) -> UpdateKind {
        match self {
            Update::FlowUpdated(_) => UpdateKind::Flow,
            Update::Stats(_) => UpdateKind::Stats,
            Update::ReplayProgress(_) => UpdateKind::Replay,
        }
    }
}

/// Ordered group of updates delivered to a subscriber in one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBatch {
    /// Monotonic per-broadcaster batch number
    pub sequence: u64,
    pub updates: Vec<Update>,
}

impl UpdateBatch {
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Which updates a subscriber wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateFilter {
    kinds: Vec<UpdateKind>,
    correlation_id: Option<String>,
}

impl Default for UpdateFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl UpdateFilter {
    pub fn all() -> Self {
        Self {
            kinds: vec![UpdateKind::Flow, UpdateKind::Stats, UpdateKind::Replay],
            correlation_id: None,
        }
    }

    pub fn only(kinds: &[UpdateKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            correlation_id: None,
        }
    }

    /// Restrict flow updates to one correlation id
    pub fn for_flow(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_all(&self) -> bool {
        self.kinds.len() == 3 && self.correlation_id.is_none()
    }

    pub fn matches(&self, update: &Update) -> bool {
        if !self.kinds.contains(&update.kind()) {
            return false;
        }
        match (update, &self.correlation_id) {
            (Update::FlowUpdated(flow), Some(wanted)) => &flow.correlation_id == wanted,
            _ => true,
        }
    }
}
