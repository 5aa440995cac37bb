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

//! Point-in-time statistics snapshot shared by the store and subscribers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_events_lifetime: u64,
    pub events_currently_stored: u64,
    pub flows_currently_tracked: u64,
    pub approx_storage_bytes: u64,
    /// EWMA of captured events per second, refreshed on the stats tick
    pub growth_rate_per_second: f64,
    pub sampled_out: u64,
    pub append_dropped: u64,
    pub capture_failures: u64,
    pub variables_truncated: u64,
    pub broadcast_dropped: u64,
    pub captured_at_us: u64,
}
