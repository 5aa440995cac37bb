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

//! Flow summaries and flow listing queries.

use serde::{Deserialize, Serialize};

/// Read-only view of one flow (all resident events sharing a correlation id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub correlation_id: String,
    pub first_timestamp_us: u64,
    pub last_timestamp_us: u64,
    /// Number of member events currently retrievable from the store
    pub event_count: usize,
    /// Highest per-flow sequence assigned so far
    pub last_flow_seq: u64,
    /// True while any resident member event is a failure
    pub has_error: bool,
    /// Originating services that contributed events, in first-seen order
    pub services: Vec<String>,
}

impl FlowSummary {
    pub fn duration_us(&self) -> u64 {
        self.last_timestamp_us.saturating_sub(self.first_timestamp_us)
    }
}

/// Filter for listing recent flows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowQuery {
    pub limit: Option<usize>,
    pub errors_only: bool,
    pub service: Option<String>,
}

impl FlowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn matches(&self, flow: &FlowSummary) -> bool {
        if self.errors_only && !flow.has_error {
            return false;
        }
        match &self.service {
            Some(service) => flow.services.iter().any(|s| s == service),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(has_error: bool, services: &[&str]) -> FlowSummary {
        FlowSummary {
            correlation_id: "c".into(),
            first_timestamp_us: 10,
            last_timestamp_us: 25,
            event_count: 2,
            last_flow_seq: 2,
            has_error,
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_query_filters() {
        let ok = summary(false, &["billing"]);
        let failed = summary(true, &["billing", "shipping"]);

        assert!(FlowQuery::new().matches(&ok));
        assert!(!FlowQuery::new().errors_only().matches(&ok));
        assert!(FlowQuery::new().errors_only().matches(&failed));
        assert!(FlowQuery::new().service("shipping").matches(&failed));
        assert!(!FlowQuery::new().service("shipping").matches(&ok));
        assert_eq!(failed.duration_us(), 15);
    }
}
