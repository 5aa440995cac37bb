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

//! Stats Aggregator
//!
//! Lock-free counters updated on the capture path, plus an EWMA growth rate
//! refreshed on a periodic tick.
//!
//! Gauges (stored events, bytes) are derived from monotonically increasing
//! counters so concurrent increments and decrements never race into a
//! negative value; a snapshot clamps at zero while both sides are in flight.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use timetravel_core::{now_us, StatsSnapshot};

/// Smoothing factor for the growth rate
pub const EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
struct RateState {
    last_tick: Option<Instant>,
    last_total: u64,
    ewma: f64,
    primed: bool,
}

/// Store-wide capture statistics
#[derive(Debug, Default)]
pub struct StatsAggregator {
    captured: AtomicU64,
    evicted: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    flows_created: AtomicU64,
    flows_removed: AtomicU64,
    sampled_out: AtomicU64,
    append_dropped: AtomicU64,
    capture_failures: AtomicU64,
    variables_truncated: AtomicU64,
    rate: Mutex<RateState>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn on_captured(&self, bytes: usize) {
        // Release: a reader that sees this also sees the eviction counted before it
        self.captured.fetch_add(1, Ordering::Release);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Release);
    }

    #[inline]
    pub fn on_evicted(&self, bytes: usize) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_flow_created(&self) {
        self.flows_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_flow_removed(&self) {
        self.flows_removed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_sampled_out(&self) {
        self.sampled_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_append_dropped(&self) {
        self.append_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_truncated(&self) {
        self.variables_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Events currently resident
    pub fn stored(&self) -> u64 {
        gauge(&self.captured, &self.evicted)
    }

    pub fn approx_bytes(&self) -> u64 {
        gauge(&self.bytes_in, &self.bytes_out)
    }

    pub fn flows_tracked(&self) -> u64 {
        gauge(&self.flows_created, &self.flows_removed)
    }

    /// Current smoothed growth rate in events per second
    pub fn growth_rate(&self) -> f64 {
        self.rate.lock().ewma
    }

    /// Refresh the growth rate from the capture counter
    pub fn tick(&self) -> f64 {
        self.tick_at(Instant::now())
    }

    /// Refresh the growth rate as of `now`.
    ///
    /// The first tick only records a baseline. Ticks with no elapsed time are
    /// ignored.
    pub fn tick_at(&self, now: Instant) -> f64 {
        let total = self.total_captured();
        let mut state = self.rate.lock();

        let Some(last) = state.last_tick else {
            state.last_tick = Some(now);
            state.last_total = total;
            return state.ewma;
        };

        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        if elapsed <= 0.0 {
            return state.ewma;
        }

        let instant_rate = total.saturating_sub(state.last_total) as f64 / elapsed;
        state.ewma = if state.primed {
            EWMA_ALPHA * instant_rate + (1.0 - EWMA_ALPHA) * state.ewma
        } else {
            instant_rate
        };
        state.primed = true;
        state.last_tick = Some(now);
        state.last_total = total;
        state.ewma
    }

    /// Consistent-enough view of every counter.
    ///
    /// `broadcast_dropped` is owned by the broadcaster and filled in by the
    /// caller.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_events_lifetime: self.total_captured(),
            events_currently_stored: self.stored(),
            flows_currently_tracked: self.flows_tracked(),
            approx_storage_bytes: self.approx_bytes(),
            growth_rate_per_second: self.growth_rate(),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            append_dropped: self.append_dropped.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            variables_truncated: self.variables_truncated.load(Ordering::Relaxed),
            broadcast_dropped: 0,
            captured_at_us: now_us(),
        }
    }
}

#[inline]
fn gauge(added: &AtomicU64, removed: &AtomicU64) -> u64 {
    // Increment side first: a removal racing past this read can only lower the
    // result, never lift it above the true peak
    let inn = added.load(Ordering::Acquire);
    let out = removed.load(Ordering::Acquire);
    inn.saturating_sub(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gauges_follow_counters() {
        let stats = StatsAggregator::new();
        stats.on_captured(100);
        stats.on_captured(50);
        stats.on_evicted(100);
        stats.on_flow_created();

        let snap = stats.snapshot();
        assert_eq!(snap.total_events_lifetime, 2);
        assert_eq!(snap.events_currently_stored, 1);
        assert_eq!(snap.approx_storage_bytes, 50);
        assert_eq!(snap.flows_currently_tracked, 1);
    }

    #[test]
    fn test_growth_rate_ewma() {
        let stats = StatsAggregator::new();
        let t0 = Instant::now();
        assert_eq!(stats.tick_at(t0), 0.0);

        for _ in 0..100 {
            stats.on_captured(1);
        }
        let first = stats.tick_at(t0 + Duration::from_secs(1));
        assert!((first - 100.0).abs() < 1e-9);

        // No new events: decays by (1 - alpha)
        let second = stats.tick_at(t0 + Duration::from_secs(2));
        assert!((second - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_elapsed_tick_is_ignored() {
        let stats = StatsAggregator::new();
        let t0 = Instant::now();
        stats.tick_at(t0);
        stats.on_captured(1);
        assert_eq!(stats.tick_at(t0), 0.0);
    }
}
