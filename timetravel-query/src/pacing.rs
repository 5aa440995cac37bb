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

//! Replay pacing against a virtual clock.
//!
//! The first event anchors the virtual clock at "now". Each following event is
//! due at `anchor + (ts - anchor_ts) / speed`. A consumer that falls more than
//! `max_catch_up` behind is re-anchored instead of receiving a burst, and long
//! gaps between consecutive events are capped at `max_step`.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    wall: Instant,
    event_us: u64,
}

#[derive(Debug, Clone)]
pub struct Pacer {
    speed: f64,
    max_catch_up: Duration,
    max_step: Duration,
    anchor: Option<Anchor>,
    last_event_us: Option<u64>,
}

impl Pacer {
    /// `speed` must be positive and finite; callers validate it
    pub fn new(speed: f64, max_catch_up: Duration, max_step: Duration) -> Self {
        Self {
            speed,
            max_catch_up,
            max_step,
            anchor: None,
            last_event_us: None,
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Forget the anchor; the next event is emitted immediately
    pub fn reset(&mut self) {
        self.anchor = None;
        self.last_event_us = None;
    }

    fn scaled(&self, delta_us: u64) -> Duration {
        let nanos = (delta_us as f64 * 1_000.0 / self.speed).round();
        if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.max_step
        }
    }

    /// How long to wait before emitting an event stamped `timestamp_us`
    pub fn delay_for(&mut self, timestamp_us: u64, now: Instant) -> Duration {
        let (anchor, last_us) = match (self.anchor, self.last_event_us) {
            (Some(anchor), Some(last_us)) => (anchor, last_us),
            _ => {
                self.anchor = Some(Anchor {
                    wall: now,
                    event_us: timestamp_us,
                });
                self.last_event_us = Some(timestamp_us);
                return Duration::ZERO;
            }
        };

        // Clock skew between services: out-of-order events pace as zero
        if timestamp_us <= last_us {
            return Duration::ZERO;
        }
        self.last_event_us = Some(timestamp_us);

        let step = self.scaled(timestamp_us - last_us);
        if step > self.max_step {
            // Compress the idle gap and restart the virtual clock after it
            self.anchor = Some(Anchor {
                wall: now + self.max_step,
                event_us: timestamp_us,
            });
            return self.max_step;
        }

        let due = anchor.wall + self.scaled(timestamp_us.saturating_sub(anchor.event_us));
        if due >= now {
            return (due - now).min(self.max_step);
        }

        if now - due > self.max_catch_up {
            self.anchor = Some(Anchor {
                wall: now,
                event_us: timestamp_us,
            });
        }
        Duration::ZERO
    }
}
