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

//! Capture Interceptor
//!
//! Wraps each handled message: sampling decision, optional variable snapshot,
//! store append and a flow update for live subscribers. Never fails and never
//! blocks the caller; every non-capture is reported as a [`CaptureOutcome`] and
//! a counter.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use timetravel_core::{
    now_us, AdaptiveSampler, DescribeVariables, EventDraft, EventId, EventOutcome,
    SamplingMetadata, VariableSnapshot,
};
use timetravel_observability::{Broadcaster, Update};
use timetravel_storage::{AppendOutcome, DropReason, EventStore};
use tracing::warn;

/// Host-supplied description of one handled message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest<'a> {
    pub correlation_id: &'a str,
    pub event_type: &'a str,
    pub service: &'a str,
    /// Defaults to the current wall clock
    pub timestamp_us: Option<u64>,
    pub outcome: EventOutcome,
    pub parent: Option<EventId>,
    pub sampling: SamplingMetadata,
}

impl<'a> CaptureRequest<'a> {
    pub fn new(correlation_id: &'a str, event_type: &'a str, service: &'a str) -> Self {
        Self {
            correlation_id,
            event_type,
            service,
            timestamp_us: None,
            outcome: EventOutcome::Success,
            parent: None,
            sampling: SamplingMetadata::default(),
        }
    }

    pub fn at(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = Some(timestamp_us);
        self
    }

    pub fn outcome(mut self, outcome: EventOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn failed(self) -> Self {
        self.outcome(EventOutcome::Failure)
    }

    pub fn parent(mut self, parent: EventId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn sampling(mut self, sampling: SamplingMetadata) -> Self {
        self.sampling = sampling;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured { id: EventId, flow_seq: u64 },
    SampledOut,
    Disabled,
    Dropped(DropReason),
}

impl CaptureOutcome {
    pub fn is_captured(&self) -> bool {
        matches!(self, CaptureOutcome::Captured { .. })
    }

    pub fn id(&self) -> Option<EventId> {
        match self {
            CaptureOutcome::Captured { id, .. } => Some(*id),
            _ => None,
        }
    }
}

pub struct CaptureInterceptor {
    enabled: AtomicBool,
    capture_state: bool,
    sampler: Arc<AdaptiveSampler>,
    store: Arc<EventStore>,
    broadcaster: Option<Broadcaster>,
}

impl CaptureInterceptor {
    pub fn new(
        sampler: Arc<AdaptiveSampler>,
        store: Arc<EventStore>,
        enabled: bool,
        capture_state: bool,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            capture_state,
            sampler,
            store,
            broadcaster: None,
        }
    }

    /// Announce captured events to live subscribers
    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn capture_state(&self) -> bool {
        self.capture_state
    }

    /// Capture one handled message.
    ///
    /// `describe` is only invoked when state capture is enabled and the event
    /// was sampled in.
    pub fn capture(
        &self,
        request: &CaptureRequest<'_>,
        describe: Option<&dyn DescribeVariables>,
    ) -> CaptureOutcome {
        if !self.is_enabled() {
            return CaptureOutcome::Disabled;
        }
        let stats = self.store.stats();
        if request.correlation_id.is_empty() {
            stats.on_append_dropped();
            return CaptureOutcome::Dropped(DropReason::MissingCorrelationId);
        }
        if !self.sampler.decide(request.correlation_id, &request.sampling) {
            stats.on_sampled_out();
            return CaptureOutcome::SampledOut;
        }

        let mut draft = EventDraft::new(
            request.correlation_id,
            request.event_type,
            request.service,
            request.timestamp_us.unwrap_or_else(now_us),
        )
        .with_outcome(request.outcome);
        if let Some(parent) = request.parent {
            draft = draft.with_parent(parent);
        }
        if self.capture_state {
            if let Some(variables) = describe.and_then(|d| self.describe(d, request)) {
                draft = draft.with_variables(variables);
            }
        }

        match self.store.append(draft) {
            AppendOutcome::Stored { id, flow_seq, .. } => {
                self.announce(request.correlation_id);
                CaptureOutcome::Captured { id, flow_seq }
            }
            AppendOutcome::Dropped(reason) => CaptureOutcome::Dropped(reason),
        }
    }

    fn describe(
        &self,
        describe: &dyn DescribeVariables,
        request: &CaptureRequest<'_>,
    ) -> Option<VariableSnapshot> {
        let mut snapshot = VariableSnapshot::new();
        let described = catch_unwind(AssertUnwindSafe(|| {
            describe.describe_variables(&mut snapshot)
        }));
        match described {
            Ok(()) if snapshot.is_empty() => None,
            Ok(()) => Some(snapshot),
            Err(_) => {
                self.store.stats().on_capture_failure();
                warn!(
                    correlation_id = request.correlation_id,
                    event_type = request.event_type,
                    "Variable snapshot panicked; capturing without variables"
                );
                None
            }
        }
    }

    fn announce(&self, correlation_id: &str) {
        let Some(broadcaster) = &self.broadcaster else {
            return;
        };
        if !broadcaster.has_subscribers() {
            return;
        }
        if let Some(summary) = self.store.flow_summary(correlation_id) {
            broadcaster.publish(Update::FlowUpdated(summary));
        }
    }
}
