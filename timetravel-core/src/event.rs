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

//! Captured event record and the ingestion-side draft it is built from.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed per-event overhead used by size estimation (struct, Arc header, index keys)
const EVENT_OVERHEAD_BYTES: usize = 160;

/// Opaque key/value snapshot of a message's own variables
pub type VariableSnapshot = BTreeMap<String, Value>;

/// Store-wide identity of a captured event: its global sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    #[inline]
    pub fn global_seq(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether the handled message succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    #[default]
    Success,
    Failure,
}

impl EventOutcome {
    #[inline]
    pub fn is_failure(self) -> bool {
        matches!(self, EventOutcome::Failure)
    }
}

/// Capability a message may implement to describe its own state.
///
/// Only invoked when state capture is enabled and the message opts in. Messages
/// that do not implement it are captured without variable detail.
pub trait DescribeVariables {
    fn describe_variables(&self, snapshot: &mut VariableSnapshot);
}

/// Host-supplied fields of an event, before the store assigns sequence numbers
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub correlation_id: String,
    pub event_type: String,
    pub timestamp_us: u64,
    pub service: String,
    pub outcome: EventOutcome,
    pub variables: Option<VariableSnapshot>,
    pub parent: Option<EventId>,
}

impl EventDraft {
    pub fn new(
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
        service: impl Into<String>,
        timestamp_us: u64,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            timestamp_us,
            service: service.into(),
            outcome: EventOutcome::Success,
            variables: None,
            parent: None,
        }
    }

    pub fn with_outcome(mut self, outcome: EventOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_variables(mut self, variables: VariableSnapshot) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_parent(mut self, parent: EventId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Approximate resident size in bytes once stored
    pub fn estimated_size(&self) -> usize {
        estimate(
            &self.correlation_id,
            &self.event_type,
            &self.service,
            self.variables.as_ref(),
        )
    }
}

/// Immutable record of one captured message.
///
/// Only the event store creates these; they are never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub id: EventId,
    /// Per-flow sequence, starting at 1, assigned at append time
    pub flow_seq: u64,
    pub correlation_id: String,
    pub event_type: String,
    pub timestamp_us: u64,
    pub service: String,
    pub outcome: EventOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<VariableSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EventId>,
}

impl CapturedEvent {
    /// Seal a draft with its store-assigned sequence numbers
    pub fn from_draft(draft: EventDraft, id: EventId, flow_seq: u64) -> Self {
        Self {
            id,
            flow_seq,
            correlation_id: draft.correlation_id,
            event_type: draft.event_type,
            timestamp_us: draft.timestamp_us,
            service: draft.service,
            outcome: draft.outcome,
            variables: draft.variables,
            parent: draft.parent,
        }
    }

    pub fn estimated_size(&self) -> usize {
        estimate(
            &self.correlation_id,
            &self.event_type,
            &self.service,
            self.variables.as_ref(),
        )
    }
}

fn estimate(
    correlation_id: &str,
    event_type: &str,
    service: &str,
    variables: Option<&VariableSnapshot>,
) -> usize {
    let strings = correlation_id.len() + event_type.len() + service.len();
    let vars = variables
        .map(|vars| {
            vars.iter()
                .map(|(key, value)| key.len() + value_size(value) + 32)
                .sum::<usize>()
        })
        .unwrap_or(0);
    EVENT_OVERHEAD_BYTES + strings + vars
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 24,
        Value::Array(items) => 24 + items.iter().map(value_size).sum::<usize>(),
        Value::Object(map) => {
            48 + map
                .iter()
                .map(|(k, v)| k.len() + value_size(v) + 24)
                .sum::<usize>()
        }
    }
}

/// Current wall-clock time in microseconds since the Unix epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
