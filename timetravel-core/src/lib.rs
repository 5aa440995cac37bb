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

//! Timetravel Core
//!
//! Data model, configuration, errors and the adaptive sampler shared by every
//! crate of the time-travel capture and replay engine.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod replay;
pub mod sampler;
pub mod stats;

pub use config::{
    BroadcasterConfig, CaptureConfig, ConfigOverrides, Preset, ReplayConfig, SamplerConfig,
};
pub use error::{Result, TimeTravelError};
pub use event::{
    now_us, CapturedEvent, DescribeVariables, EventDraft, EventId, EventOutcome,
    VariableSnapshot,
};
pub use flow::{FlowQuery, FlowSummary};
pub use replay::{
    InvalidTransition, ReplayCommand, ReplayMode, ReplayScope, ReplaySnapshot, ReplayStatus,
    SessionId,
};
pub use sampler::{
    flow_hash, AdaptiveSampler, Adjustment, LoadProbe, NoPressure, PressureProbe,
    PressureSignals, SamplingHint, SamplingMetadata,
};
pub use stats::StatsSnapshot;
