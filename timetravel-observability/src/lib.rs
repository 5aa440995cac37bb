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

//! Timetravel Observability
//!
//! Live update broadcasting to subscribers, and the `tracing` subscriber setup
//! shared by every binary.

pub mod broadcaster;
pub mod logging;
pub mod sink;
pub mod update;

pub use broadcaster::{Broadcaster, BroadcasterStats, SubscriberId};
pub use logging::{init_logging, LogFormat, LoggingConfig, LOG_FORMAT_ENV};
pub use sink::{CallbackSink, ChannelSink, SinkError, UpdateSink};
pub use update::{Update, UpdateBatch, UpdateFilter, UpdateKind};
