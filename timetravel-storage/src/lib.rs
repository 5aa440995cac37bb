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

//! Timetravel Storage
//!
//! Bounded in-memory event store: a fixed-capacity ring of slots plus a flow
//! index, a coarse time index and lock-free statistics.

pub mod flow_index;
pub mod ring_buffer;
pub mod stats;
pub mod time_index;

pub use flow_index::{FlowIndex, Registration};
pub use ring_buffer::{AppendOutcome, DropReason, EventStore, StoreOptions};
pub use stats::{StatsAggregator, EWMA_ALPHA};
pub use time_index::{EventKey, TimeIndex, TIME_SHARDS};
