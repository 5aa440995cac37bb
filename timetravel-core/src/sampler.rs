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

//! Adaptive Sampler
//!
//! Decides on the hot path whether an event is captured. The decision is a pure
//! function of the correlation id and the current rate: the id is hashed into
//! `[0, u64::MAX]` and compared with `rate × u64::MAX`, so every service that
//! sees the same flow makes the same decision and flows are never captured
//! with holes.
//!
//! The rate is adapted on a periodic tick, never per event:
//! - fill ratio above the high watermark, or high resource pressure:
//!   multiplicative decrease (floored at `min_rate`)
//! - fill ratio below the low watermark and low resource pressure:
//!   additive increase (capped at the configured rate)
//!
//! ## Performance Characteristics
//! - `decide`: one relaxed atomic load plus one XxHash64 over the id, no locks
//! - `adjust`: called once per tick from the maintenance loop

use crate::config::SamplerConfig;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use twox_hash::XxHash64;

/// Fixed hash seed; changing it changes which flows are sampled everywhere
const FLOW_HASH_SEED: u64 = 0x7469_6d65_7472_6176;

/// Per-flow override set by the host (e.g. from a propagated debug header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingHint {
    #[default]
    Default,
    Always,
    Never,
}

/// Metadata accompanying a sampling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplingMetadata {
    pub hint: SamplingHint,
}

impl SamplingMetadata {
    pub fn with_hint(hint: SamplingHint) -> Self {
        Self { hint }
    }
}

/// Inputs to one rate adjustment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSignals {
    /// Store fill ratio in [0, 1]
    pub fill_ratio: f64,
    /// Host resource pressure in [0, 1]
    pub resource_pressure: f64,
}

/// Direction of a rate adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Decreased,
    Increased,
    Unchanged,
}

/// Source of host resource pressure in [0, 1]
pub trait PressureProbe: Send + Sync {
    fn pressure(&self) -> f64;
}

/// Probe for hosts that report no pressure
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPressure;

impl PressureProbe for NoPressure {
    fn pressure(&self) -> f64 {
        0.0
    }
}

/// Load score fed by the host from observed handler latency.
///
/// Pressure is `observed / target`, clamped to [0, 1].
#[derive(Debug)]
pub struct LoadProbe {
    target_latency_us: u64,
    /// Load score in basis points (10_000 = at target)
    score_bp: AtomicU64,
}

impl LoadProbe {
    pub fn new(target_latency_us: u64) -> Self {
        Self {
            target_latency_us: target_latency_us.max(1),
            score_bp: AtomicU64::new(0),
        }
    }

    /// Report the latest observed latency
    pub fn report_latency(&self, observed_latency_us: u64) {
        let score = observed_latency_us.saturating_mul(10_000) / self.target_latency_us;
        self.score_bp.store(score.min(10_000), Ordering::Relaxed);
    }
}

impl PressureProbe for LoadProbe {
    fn pressure(&self) -> f64 {
        self.score_bp.load(Ordering::Relaxed) as f64 / 10_000.0
    }
}

/// Hash a correlation id into the sampling range
#[inline]
pub fn flow_hash(correlation_id: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(FLOW_HASH_SEED);
    hasher.write(correlation_id.as_bytes());
    hasher.finish()
}

/// Lock-free adaptive sampler
#[derive(Debug)]
pub struct AdaptiveSampler {
    /// Current rate as f64 bits
    rate_bits: AtomicU64,
    /// Acceptance threshold derived from the current rate
    threshold: AtomicU64,
    max_rate: f64,
    min_rate: f64,
    config: SamplerConfig,
    adjustments: AtomicU64,
}

impl AdaptiveSampler {
    /// Create a sampler starting (and capped) at `rate`
    pub fn new(rate: f64, config: SamplerConfig) -> Self {
        let max_rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        let min_rate = config.min_rate.clamp(0.0, max_rate);
        Self {
            rate_bits: AtomicU64::new(max_rate.to_bits()),
            threshold: AtomicU64::new(threshold_for(max_rate)),
            max_rate,
            min_rate,
            config,
            adjustments: AtomicU64::new(0),
        }
    }

    /// Decide whether events of this flow are captured
    #[inline]
    pub fn decide(&self, correlation_id: &str, metadata: &SamplingMetadata) -> bool {
        match metadata.hint {
            SamplingHint::Always => return true,
            SamplingHint::Never => return false,
            SamplingHint::Default => {}
        }

        let threshold = self.threshold.load(Ordering::Relaxed);
        if threshold == 0 {
            return false;
        }
        flow_hash(correlation_id) <= threshold
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }

    pub fn min_rate(&self) -> f64 {
        self.min_rate
    }

    /// Number of rate changes so far
    pub fn adjustments(&self) -> u64 {
        self.adjustments.load(Ordering::Relaxed)
    }

    /// Adapt the rate to the current fill ratio and resource pressure.
    ///
    /// Non-finite inputs or results keep the last-known-good rate.
    pub fn adjust(&self, signals: PressureSignals) -> Adjustment {
        let PressureSignals {
            fill_ratio,
            resource_pressure,
        } = signals;
        if !fill_ratio.is_finite() || !resource_pressure.is_finite() {
            debug!(
                fill_ratio,
                resource_pressure, "Ignoring non-finite sampler signals"
            );
            return Adjustment::Unchanged;
        }

        let current = self.rate();
        let cfg = &self.config;

        let (next, direction) = if fill_ratio > cfg.high_watermark
            || resource_pressure >= cfg.pressure_high
        {
            (
                (current * cfg.backoff_factor).max(self.min_rate),
                Adjustment::Decreased,
            )
        } else if fill_ratio < cfg.low_watermark && resource_pressure <= cfg.pressure_low {
            (
                (current + cfg.increase_step).min(self.max_rate),
                Adjustment::Increased,
            )
        } else {
            return Adjustment::Unchanged;
        };

        if !next.is_finite() || next == current {
            return Adjustment::Unchanged;
        }

        self.rate_bits.store(next.to_bits(), Ordering::Relaxed);
        self.threshold.store(threshold_for(next), Ordering::Relaxed);
        self.adjustments.fetch_add(1, Ordering::Relaxed);
        debug!(
            from = current,
            to = next,
            fill_ratio,
            resource_pressure,
            "Sampling rate adjusted"
        );
        direction
    }
}

/// Map a rate in [0, 1] onto the hash range
#[inline]
fn threshold_for(rate: f64) -> u64 {
    if rate <= 0.0 {
        0
    } else if rate >= 1.0 {
        u64::MAX
    } else {
        // Saturating float-to-int cast; never 0 for a positive rate.
        ((rate * u64::MAX as f64) as u64).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(rate: f64) -> AdaptiveSampler {
        AdaptiveSampler::new(rate, SamplerConfig::default())
    }

    fn signals(fill_ratio: f64, resource_pressure: f64) -> PressureSignals {
        PressureSignals {
            fill_ratio,
            resource_pressure,
        }
    }

    #[test]
    fn test_zero_rate_rejects_everything() {
        let s = sampler(0.0);
        let meta = SamplingMetadata::default();
        for i in 0..1000 {
            assert!(!s.decide(&format!("flow-{}", i), &meta));
        }
    }

    #[test]
    fn test_full_rate_accepts_everything() {
        let s = sampler(1.0);
        let meta = SamplingMetadata::default();
        for i in 0..1000 {
            assert!(s.decide(&format!("flow-{}", i), &meta));
        }
    }

    #[test]
    fn test_decision_is_deterministic_per_flow() {
        let s = sampler(0.3);
        let meta = SamplingMetadata::default();
        for i in 0..200 {
            let id = format!("corr-{}", i);
            let first = s.decide(&id, &meta);
            for _ in 0..5 {
                assert_eq!(s.decide(&id, &meta), first);
            }
        }
    }

    #[test]
    fn test_same_decision_across_sampler_instances() {
        // Two services with the same rate agree on every flow
        let a = sampler(0.5);
        let b = sampler(0.5);
        let meta = SamplingMetadata::default();
        for i in 0..500 {
            let id = format!("shared-{}", i);
            assert_eq!(a.decide(&id, &meta), b.decide(&id, &meta));
        }
    }

    #[test]
    fn test_rate_approximates_acceptance() {
        let s = sampler(0.25);
        let meta = SamplingMetadata::default();
        let accepted = (0..20_000)
            .filter(|i| s.decide(&format!("id-{}", i), &meta))
            .count();
        let ratio = accepted as f64 / 20_000.0;
        assert!((0.22..0.28).contains(&ratio), "ratio {}", ratio);
    }

    #[test]
    fn test_hints_override_rate() {
        let s = sampler(0.0);
        assert!(s.decide("x", &SamplingMetadata::with_hint(SamplingHint::Always)));
        let s = sampler(1.0);
        assert!(!s.decide("x", &SamplingMetadata::with_hint(SamplingHint::Never)));
    }

    #[test]
    fn test_high_fill_halves_rate_down_to_floor() {
        let s = sampler(0.8);
        assert_eq!(s.adjust(signals(0.99, 0.0)), Adjustment::Decreased);
        assert!((s.rate() - 0.4).abs() < 1e-9);

        for _ in 0..20 {
            s.adjust(signals(0.99, 0.0));
        }
        assert!((s.rate() - s.min_rate()).abs() < 1e-9);
        assert_eq!(s.adjust(signals(0.99, 0.0)), Adjustment::Unchanged);
    }

    #[test]
    fn test_resource_pressure_cuts_rate() {
        let s = sampler(0.8);
        assert_eq!(s.adjust(signals(0.1, 0.9)), Adjustment::Decreased);
    }

    #[test]
    fn test_low_fill_recovers_additively_to_max() {
        let s = sampler(0.2);
        s.adjust(signals(1.0, 0.0));
        assert!((s.rate() - 0.1).abs() < 1e-9);

        assert_eq!(s.adjust(signals(0.1, 0.0)), Adjustment::Increased);
        assert!((s.rate() - 0.15).abs() < 1e-9);

        for _ in 0..10 {
            s.adjust(signals(0.1, 0.0));
        }
        assert!((s.rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_between_watermarks_keeps_rate() {
        let s = sampler(0.5);
        assert_eq!(s.adjust(signals(0.85, 0.0)), Adjustment::Unchanged);
        // Plenty of room but moderate pressure
        assert_eq!(s.adjust(signals(0.1, 0.6)), Adjustment::Unchanged);
        assert_eq!(s.rate(), 0.5);
    }

    #[test]
    fn test_non_finite_signals_keep_last_good_rate() {
        let s = sampler(0.5);
        assert_eq!(s.adjust(signals(f64::NAN, 0.0)), Adjustment::Unchanged);
        assert_eq!(s.adjust(signals(0.99, f64::INFINITY)), Adjustment::Unchanged);
        assert_eq!(s.rate(), 0.5);
    }

    #[test]
    fn test_load_probe() {
        let probe = LoadProbe::new(1_000);
        assert_eq!(probe.pressure(), 0.0);
        probe.report_latency(500);
        assert!((probe.pressure() - 0.5).abs() < 1e-9);
        probe.report_latency(5_000);
        assert_eq!(probe.pressure(), 1.0);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A flow sampled at a low rate is also sampled at every higher rate
            #[test]
            fn prop_sampling_is_nested(id in "[a-z0-9-]{1,24}", low in 0.0f64..1.0, extra in 0.0f64..1.0) {
                let high = (low + extra).min(1.0);
                let meta = SamplingMetadata::default();
                let lo = AdaptiveSampler::new(low, SamplerConfig::default());
                let hi = AdaptiveSampler::new(high, SamplerConfig::default());
                if lo.decide(&id, &meta) {
                    prop_assert!(hi.decide(&id, &meta));
                }
            }

            /// The rate never leaves [min_rate, max_rate]
            #[test]
            fn prop_rate_stays_in_bounds(
                rate in 0.05f64..1.0,
                steps in proptest::collection::vec((0.0f64..1.0, 0.0f64..1.0), 1..40),
            ) {
                let s = AdaptiveSampler::new(rate, SamplerConfig::default());
                for (fill, pressure) in steps {
                    s.adjust(PressureSignals { fill_ratio: fill, resource_pressure: pressure });
                    prop_assert!(s.rate() >= s.min_rate() - 1e-12);
                    prop_assert!(s.rate() <= s.max_rate() + 1e-12);
                }
            }
        }
    }
}
