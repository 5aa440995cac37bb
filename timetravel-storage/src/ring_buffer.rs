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

//! Ring Buffer Event Store
//!
//! Fixed-capacity store of captured events. Appends take a global sequence
//! number from a single atomic cursor and write to `slot = seq % capacity`,
//! overwriting (and thereby evicting) whatever the slot held.
//!
//! ## Slot protocol
//!
//! Each slot carries a `stamp`: `seq + 1` of the event it was last claimed for,
//! with the high bit set while a writer is publishing. A writer claims its slot
//! with a CAS and gives up if a newer sequence already owns it, so a lapped
//! writer can never clobber a newer event. Readers never block writers: they
//! load the slot's `Arc` and check the embedded id.
//!
//! ```text
//! append ──► cursor.fetch_add ──► claim slot ──► flow index ──► publish
//!                                                              │
//!                                    retire overwritten ◄──────┘
//!                                    (time index, flow index, stats)
//! ```
//!
//! Secondary indices are updated while the slot is claimed, so anything the
//! flow or time index returns is readable unless it has since been evicted.

use crate::flow_index::FlowIndex;
use crate::stats::StatsAggregator;
use crate::time_index::{EventKey, TimeIndex};
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use timetravel_core::{
    CaptureConfig, CapturedEvent, EventDraft, EventId, FlowQuery, FlowSummary, StatsSnapshot,
};
use tracing::{debug, trace};

/// Set in a slot stamp while a writer holds the slot
const WRITING: u64 = 1 << 63;

/// Busy-wait iterations before yielding the thread
const SPINS_BEFORE_YIELD: u32 = 64;

/// Retention sweep batch size
const SWEEP_BATCH: usize = 1024;

/// Why an append did not store its event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// A writer one or more laps ahead already owns the slot
    SlotOverrun,
    /// Event exceeds the size limit even without variables
    TooLarge,
    /// Empty correlation id
    MissingCorrelationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored {
        id: EventId,
        flow_seq: u64,
        /// Event overwritten in the slot, if any
        evicted: Option<EventId>,
        flow_created: bool,
    },
    Dropped(DropReason),
}

impl AppendOutcome {
    pub fn id(&self) -> Option<EventId> {
        match self {
            AppendOutcome::Stored { id, .. } => Some(*id),
            AppendOutcome::Dropped(_) => None,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, AppendOutcome::Stored { .. })
    }
}

/// Sizing of an [`EventStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub capacity: usize,
    pub max_steps_per_flow: usize,
    pub max_event_bytes: usize,
    pub time_bucket_us: u64,
}

impl StoreOptions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            max_steps_per_flow: 1_000,
            max_event_bytes: 4_096,
            time_bucket_us: 1_000_000,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            capacity: config.buffer_capacity,
            max_steps_per_flow: config.max_steps_per_flow,
            max_event_bytes: config.max_event_bytes,
            time_bucket_us: config.time_bucket_us(),
        }
    }

    pub fn max_steps_per_flow(mut self, steps: usize) -> Self {
        self.max_steps_per_flow = steps;
        self
    }

    pub fn max_event_bytes(mut self, bytes: usize) -> Self {
        self.max_event_bytes = bytes;
        self
    }

    pub fn time_bucket_us(mut self, bucket_us: u64) -> Self {
        self.time_bucket_us = bucket_us;
        self
    }
}

struct Slot {
    stamp: AtomicU64,
    event: ArcSwapOption<CapturedEvent>,
}

impl Slot {
    fn new() -> Self {
        Self {
            stamp: AtomicU64::new(0),
            event: ArcSwapOption::empty(),
        }
    }

    /// Take the slot for `stamp`; false if a newer sequence owns it
    fn claim(&self, stamp: u64) -> bool {
        let mut spins = 0;
        loop {
            let current = self.stamp.load(Ordering::Acquire);
            if current & !WRITING >= stamp {
                return false;
            }
            if current & WRITING != 0 {
                backoff(&mut spins);
                continue;
            }
            if self
                .stamp
                .compare_exchange_weak(current, WRITING | stamp, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Re-take the slot still owned by `stamp`; false once a newer writer has it
    fn reclaim(&self, stamp: u64) -> bool {
        let mut spins = 0;
        loop {
            let current = self.stamp.load(Ordering::Acquire);
            if current & WRITING != 0 && current & !WRITING <= stamp {
                backoff(&mut spins);
                continue;
            }
            if current != stamp {
                return false;
            }
            if self
                .stamp
                .compare_exchange_weak(current, WRITING | stamp, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self, stamp: u64) {
        self.stamp.store(stamp, Ordering::Release);
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
    *spins += 1;
}

/// Bounded in-memory event store with flow and time indices
pub struct EventStore {
    slots: Box<[Slot]>,
    cursor: AtomicU64,
    flows: FlowIndex,
    time: TimeIndex,
    stats: Arc<StatsAggregator>,
    max_event_bytes: usize,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("capacity", &self.slots.len())
            .field("len", &self.len())
            .field("flows", &self.flows.len())
            .field("cursor", &self.cursor())
            .finish()
    }
}

impl EventStore {
    pub fn new(options: StoreOptions) -> Self {
        Self::with_stats(options, Arc::new(StatsAggregator::new()))
    }

    /// Create a store reporting into a shared aggregator
    pub fn with_stats(options: StoreOptions, stats: Arc<StatsAggregator>) -> Self {
        let capacity = options.capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            cursor: AtomicU64::new(0),
            flows: FlowIndex::new(options.max_steps_per_flow),
            time: TimeIndex::new(options.time_bucket_us),
            stats,
            max_event_bytes: options.max_event_bytes,
        }
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot {
        &self.slots[(seq % self.slots.len() as u64) as usize]
    }

    /// Store an event, evicting the slot's previous occupant.
    ///
    /// Never blocks on readers. Variables are stripped from oversized events.
    pub fn append(&self, mut draft: EventDraft) -> AppendOutcome {
        let mut size = draft.estimated_size();
        if size > self.max_event_bytes && draft.variables.is_some() {
            draft.variables = None;
            size = draft.estimated_size();
            self.stats.on_truncated();
            trace!(correlation_id = %draft.correlation_id, "Stripped oversized variables");
        }
        if size > self.max_event_bytes {
            self.stats.on_append_dropped();
            return AppendOutcome::Dropped(DropReason::TooLarge);
        }

        let seq = self.cursor.fetch_add(1, Ordering::AcqRel);
        let id = EventId(seq);
        let stamp = seq + 1;
        let slot = self.slot(seq);
        if !slot.claim(stamp) {
            self.stats.on_append_dropped();
            debug!(seq, "Slot already owned by a newer writer, dropping event");
            return AppendOutcome::Dropped(DropReason::SlotOverrun);
        }

        let registration = self.flows.register(
            &draft.correlation_id,
            id,
            draft.timestamp_us,
            draft.outcome.is_failure(),
            &draft.service,
        );
        if registration.created {
            self.stats.on_flow_created();
        }

        let key = EventKey::new(draft.timestamp_us, id);
        let event = Arc::new(CapturedEvent::from_draft(draft, id, registration.flow_seq));
        let previous = slot.event.swap(Some(event));
        self.time.insert(key);
        slot.release(stamp);

        // Removals are counted before the addition so the stored gauge never
        // passes capacity
        let evicted = previous.map(|old| {
            self.retire(&old, true);
            old.id
        });
        if let Some(overflow) = registration.overflow {
            if let Some(old) = self.take(overflow) {
                // Already unlinked from its flow by the step cap
                self.retire(&old, false);
            }
        }
        self.stats.on_captured(size);

        AppendOutcome::Stored {
            id,
            flow_seq: registration.flow_seq,
            evicted,
            flow_created: registration.created,
        }
    }

    /// Remove a still-resident event from its slot
    fn take(&self, id: EventId) -> Option<Arc<CapturedEvent>> {
        let stamp = id.0 + 1;
        let slot = self.slot(id.0);
        if !slot.reclaim(stamp) {
            return None;
        }
        let taken = slot.event.swap(None);
        slot.release(stamp);
        taken.filter(|event| event.id == id)
    }

    fn retire(&self, old: &CapturedEvent, unlink_flow: bool) {
        self.time.remove(EventKey::new(old.timestamp_us, old.id));
        if unlink_flow && self.flows.remove_member(&old.correlation_id, old.id) {
            self.stats.on_flow_removed();
        }
        self.stats.on_evicted(old.estimated_size());
    }

    /// Point lookup; `None` once the event has been evicted
    pub fn get(&self, id: EventId) -> Option<Arc<CapturedEvent>> {
        if id.0 >= self.cursor.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.slot(id.0);
        let mut spins = 0;
        while slot.stamp.load(Ordering::Acquire) == WRITING | (id.0 + 1) {
            backoff(&mut spins);
        }
        slot.event.load_full().filter(|event| event.id == id)
    }

    /// Resident events of a flow in per-flow sequence order
    pub fn flow_events(&self, correlation_id: &str) -> Option<Vec<Arc<CapturedEvent>>> {
        let members = self.flows.members(correlation_id)?;
        Some(members.into_iter().filter_map(|id| self.get(id)).collect())
    }

    /// Resident member ids of a flow in per-flow sequence order
    pub fn flow_members(&self, correlation_id: &str) -> Option<Vec<EventId>> {
        self.flows.members(correlation_id)
    }

    pub fn flow_summary(&self, correlation_id: &str) -> Option<FlowSummary> {
        self.flows.summary(correlation_id)
    }

    pub fn list_flows(&self, query: &FlowQuery) -> Vec<FlowSummary> {
        self.flows.list(query)
    }

    pub fn contains_flow(&self, correlation_id: &str) -> bool {
        self.flows.contains(correlation_id)
    }

    /// Resident ancestors of an event, nearest first, following parent links
    pub fn ancestors(&self, id: EventId, max_depth: usize) -> Vec<Arc<CapturedEvent>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = self.get(id).and_then(|event| event.parent);

        while let Some(parent) = next {
            if chain.len() >= max_depth || !seen.insert(parent) {
                break;
            }
            let Some(event) = self.get(parent) else {
                break;
            };
            next = event.parent;
            chain.push(event);
        }
        chain
    }

    /// Up to `limit` resident events with `start_us <= timestamp <= end_us`,
    /// ordered by `(timestamp, global_seq)`
    pub fn events_in_range(
        &self,
        start_us: u64,
        end_us: u64,
        limit: usize,
    ) -> Vec<Arc<CapturedEvent>> {
        let bound = self.cursor();
        let mut keys: Vec<EventKey> = (0..self.time.shard_count())
            .flat_map(|shard| self.time.page(shard, None, start_us, end_us, bound, limit))
            .collect();
        keys.sort_unstable();
        keys.truncate(limit);
        keys.into_iter().filter_map(|key| self.get(key.id)).collect()
    }

    /// Resident events in the inclusive range
    pub fn count_range(&self, start_us: u64, end_us: u64) -> u64 {
        self.time.count(start_us, end_us, self.cursor())
    }

    /// Resident events in the inclusive range with global sequence below `bound`
    pub fn count_range_before(&self, start_us: u64, end_us: u64, bound: u64) -> u64 {
        self.time.count(start_us, end_us, bound)
    }

    /// Next global sequence to be assigned
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn time_index(&self) -> &TimeIndex {
        &self.time
    }

    /// Evict every event with a timestamp before `cutoff_us`
    pub fn evict_older_than(&self, cutoff_us: u64) -> usize {
        let mut evicted = 0;
        loop {
            let keys = self.time.keys_before(cutoff_us, SWEEP_BATCH);
            let mut round = 0;
            for key in &keys {
                if let Some(old) = self.take(key.id) {
                    self.retire(&old, true);
                    round += 1;
                }
            }
            evicted += round;
            // Keys whose slot was lapped are retired by the overwriting writer
            if round == 0 || keys.len() < SWEEP_BATCH {
                break;
            }
        }
        if evicted > 0 {
            debug!(evicted, cutoff_us, "Retention sweep evicted events");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        (self.stats.stored() as usize).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn fill_ratio(&self) -> f64 {
        (self.len() as f64 / self.capacity() as f64).min(1.0)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
