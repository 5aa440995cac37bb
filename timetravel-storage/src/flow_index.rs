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

//! Flow index: correlation id -> resident member events.
//!
//! Backed by a DashMap so writers of different flows never contend. Members
//! are kept in per-flow sequence order; the oldest member is the one evicted
//! when a flow exceeds its step cap.
//!
//! A flow whose last member is evicted is removed. If the same correlation id
//! is captured again afterwards it starts a new flow with `flow_seq` 1.

use dashmap::DashMap;
use std::collections::VecDeque;
use timetravel_core::{EventId, FlowQuery, FlowSummary};

/// Services remembered per flow
const MAX_SERVICES_PER_FLOW: usize = 16;

/// Result of registering one event with its flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub flow_seq: u64,
    /// First member of a new flow
    pub created: bool,
    /// Oldest member pushed out by the step cap
    pub overflow: Option<EventId>,
}

#[derive(Debug, Clone, Copy)]
struct Member {
    id: EventId,
    timestamp_us: u64,
    failed: bool,
}

#[derive(Debug)]
struct FlowEntry {
    first_timestamp_us: u64,
    last_timestamp_us: u64,
    last_flow_seq: u64,
    members: VecDeque<Member>,
    failed_members: usize,
    services: Vec<String>,
}

impl FlowEntry {
    fn new(timestamp_us: u64) -> Self {
        Self {
            first_timestamp_us: timestamp_us,
            last_timestamp_us: timestamp_us,
            last_flow_seq: 0,
            members: VecDeque::new(),
            failed_members: 0,
            services: Vec::new(),
        }
    }

    fn push(
        &mut self,
        id: EventId,
        timestamp_us: u64,
        failed: bool,
        service: &str,
        max_steps: usize,
    ) -> (u64, Option<EventId>) {
        self.last_flow_seq += 1;
        self.first_timestamp_us = self.first_timestamp_us.min(timestamp_us);
        self.last_timestamp_us = self.last_timestamp_us.max(timestamp_us);
        self.members.push_back(Member {
            id,
            timestamp_us,
            failed,
        });
        if failed {
            self.failed_members += 1;
        }
        if self.services.len() < MAX_SERVICES_PER_FLOW && !self.services.iter().any(|s| s == service)
        {
            self.services.push(service.to_string());
        }

        let overflow = if self.members.len() > max_steps {
            self.members.pop_front().map(|m| {
                if m.failed {
                    self.failed_members -= 1;
                }
                m.id
            })
        } else {
            None
        };
        if overflow.is_some() {
            self.refresh_first_timestamp();
        }
        (self.last_flow_seq, overflow)
    }

    fn remove(&mut self, id: EventId) -> bool {
        let Some(pos) = self.members.iter().position(|m| m.id == id) else {
            return false;
        };
        if let Some(m) = self.members.remove(pos) {
            if m.failed {
                self.failed_members -= 1;
            }
            if m.timestamp_us <= self.first_timestamp_us {
                self.refresh_first_timestamp();
            }
        }
        true
    }

    /// Earliest resident timestamp; unchanged once the flow is empty
    fn refresh_first_timestamp(&mut self) {
        if let Some(first) = self.members.iter().map(|m| m.timestamp_us).min() {
            self.first_timestamp_us = first;
        }
    }

    fn summary(&self, correlation_id: &str) -> FlowSummary {
        FlowSummary {
            correlation_id: correlation_id.to_string(),
            first_timestamp_us: self.first_timestamp_us,
            last_timestamp_us: self.last_timestamp_us,
            event_count: self.members.len(),
            last_flow_seq: self.last_flow_seq,
            has_error: self.failed_members > 0,
            services: self.services.clone(),
        }
    }
}

/// Concurrent index of resident flows
#[derive(Debug)]
pub struct FlowIndex {
    flows: DashMap<String, FlowEntry>,
    max_steps: usize,
}

impl FlowIndex {
    pub fn new(max_steps_per_flow: usize) -> Self {
        Self {
            flows: DashMap::new(),
            max_steps: max_steps_per_flow.max(1),
        }
    }

    /// Add an event to its flow and assign its per-flow sequence
    pub fn register(
        &self,
        correlation_id: &str,
        id: EventId,
        timestamp_us: u64,
        failed: bool,
        service: &str,
    ) -> Registration {
        if let Some(mut entry) = self.flows.get_mut(correlation_id) {
            let (flow_seq, overflow) = entry.push(id, timestamp_us, failed, service, self.max_steps);
            return Registration {
                flow_seq,
                created: false,
                overflow,
            };
        }

        let mut created = false;
        let mut entry = self
            .flows
            .entry(correlation_id.to_string())
            .or_insert_with(|| {
                created = true;
                FlowEntry::new(timestamp_us)
            });
        let (flow_seq, overflow) = entry.push(id, timestamp_us, failed, service, self.max_steps);
        Registration {
            flow_seq,
            created,
            overflow,
        }
    }

    /// Drop an evicted member. Returns true if this removed the whole flow.
    pub fn remove_member(&self, correlation_id: &str, id: EventId) -> bool {
        {
            let Some(mut entry) = self.flows.get_mut(correlation_id) else {
                return false;
            };
            if !entry.remove(id) || !entry.members.is_empty() {
                return false;
            }
        }
        // A concurrent register may have refilled the flow in between
        self.flows
            .remove_if(correlation_id, |_, entry| entry.members.is_empty())
            .is_some()
    }

    /// Resident member ids in per-flow sequence order
    pub fn members(&self, correlation_id: &str) -> Option<Vec<EventId>> {
        self.flows
            .get(correlation_id)
            .map(|entry| entry.members.iter().map(|m| m.id).collect())
    }

    pub fn summary(&self, correlation_id: &str) -> Option<FlowSummary> {
        self.flows
            .get(correlation_id)
            .map(|entry| entry.summary(correlation_id))
    }

    /// Matching flows, most recently active first
    pub fn list(&self, query: &FlowQuery) -> Vec<FlowSummary> {
        let mut flows: Vec<FlowSummary> = self
            .flows
            .iter()
            .map(|entry| entry.value().summary(entry.key()))
            .filter(|summary| query.matches(summary))
            .collect();

        flows.sort_by(|a, b| {
            b.last_timestamp_us
                .cmp(&a.last_timestamp_us)
                .then_with(|| a.correlation_id.cmp(&b.correlation_id))
        });
        if let Some(limit) = query.limit {
            flows.truncate(limit);
        }
        flows
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.flows.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_seq_is_contiguous() {
        let index = FlowIndex::new(10);
        let a = index.register("f", EventId(0), 100, false, "api");
        let b = index.register("f", EventId(5), 90, true, "db");
        assert!(a.created);
        assert!(!b.created);
        assert_eq!((a.flow_seq, b.flow_seq), (1, 2));

        let summary = index.summary("f").unwrap();
        assert_eq!(summary.first_timestamp_us, 90);
        assert_eq!(summary.last_timestamp_us, 100);
        assert_eq!(summary.services, vec!["api", "db"]);
        assert!(summary.has_error);
    }

    #[test]
    fn test_step_cap_pushes_out_oldest() {
        let index = FlowIndex::new(2);
        index.register("f", EventId(1), 1, true, "s");
        index.register("f", EventId(2), 2, false, "s");
        let r = index.register("f", EventId(3), 3, false, "s");

        assert_eq!(r.overflow, Some(EventId(1)));
        assert_eq!(index.members("f").unwrap(), vec![EventId(2), EventId(3)]);
        // The only failure was pushed out
        assert!(!index.summary("f").unwrap().has_error);
    }

    #[test]
    fn test_first_timestamp_follows_eviction() {
        let index = FlowIndex::new(3);
        index.register("f", EventId(1), 10, false, "s");
        index.register("f", EventId(2), 30, false, "s");
        index.register("f", EventId(3), 20, false, "s");

        assert!(!index.remove_member("f", EventId(1)));
        let summary = index.summary("f").unwrap();
        assert_eq!(summary.first_timestamp_us, 20);
        assert_eq!(summary.last_timestamp_us, 30);

        // Step cap pushes out id 2; id 3 is still the earliest
        index.register("f", EventId(4), 40, false, "s");
        index.register("f", EventId(5), 50, false, "s");
        assert_eq!(index.members("f").unwrap(), vec![EventId(3), EventId(4), EventId(5)]);
        assert_eq!(index.summary("f").unwrap().first_timestamp_us, 20);

        index.register("f", EventId(6), 60, false, "s");
        assert_eq!(index.summary("f").unwrap().first_timestamp_us, 40);
    }

    #[test]
    fn test_last_member_removes_flow() {
        let index = FlowIndex::new(10);
        index.register("f", EventId(1), 1, false, "s");
        index.register("f", EventId(2), 2, false, "s");

        assert!(!index.remove_member("f", EventId(1)));
        assert!(!index.remove_member("f", EventId(1)));
        assert!(index.remove_member("f", EventId(2)));
        assert!(!index.contains("f"));

        // Same correlation id starts over
        let r = index.register("f", EventId(9), 9, false, "s");
        assert!(r.created);
        assert_eq!(r.flow_seq, 1);
    }

    #[test]
    fn test_list_orders_by_recency() {
        let index = FlowIndex::new(10);
        index.register("old", EventId(1), 10, false, "a");
        index.register("new", EventId(2), 30, true, "b");
        index.register("mid", EventId(3), 20, false, "a");

        let all: Vec<_> = index
            .list(&FlowQuery::new())
            .into_iter()
            .map(|f| f.correlation_id)
            .collect();
        assert_eq!(all, vec!["new", "mid", "old"]);

        assert_eq!(index.list(&FlowQuery::new().limit(1)).len(), 1);
        assert_eq!(index.list(&FlowQuery::new().errors_only()).len(), 1);
        assert_eq!(index.list(&FlowQuery::new().service("a")).len(), 2);
    }
}
