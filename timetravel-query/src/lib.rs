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

//! Timetravel Query
//!
//! The capture interceptor, the replay engine and the [`TimeTravel`]
//! composition root that exposes the query, replay and subscription API.
//!
//! # Example
//!
//! ```no_run
//! use timetravel_core::{CaptureConfig, Preset};
//! use timetravel_query::{CaptureRequest, TimeTravel};
//!
//! # async fn run() -> timetravel_core::Result<()> {
//! let engine = TimeTravel::new(CaptureConfig::from_preset(Preset::Development))?;
//! engine.start();
//!
//! engine.capture(&CaptureRequest::new("order-42", "OrderPlaced", "checkout"), None);
//! let flow = engine.get_flow("order-42")?;
//!
//! let session = engine.start_flow_replay("order-42", 10.0)?;
//! while let Some(event) = engine.advance(session.id).await?.event().cloned() {
//!     println!("{} {}", event.timestamp_us, event.event_type);
//! }
//! # let _ = flow;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod engine;
pub mod merge;
pub mod pacing;
pub mod replay;

pub use capture::{CaptureInterceptor, CaptureOutcome, CaptureRequest};
pub use engine::TimeTravel;
pub use merge::{system_scan, KWayMerge, ShardScan, SystemScan};
pub use pacing::Pacer;
pub use replay::{AdvanceOutcome, ReplayEngine, ReplayStep};
