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

//! Capture engine configuration
//!
//! Configuration starts from a named preset (sampling rate, buffer capacity,
//! state capture) and is refined by explicit per-field overrides coming from a
//! TOML file, environment variables or code. Priority: env > file > preset.
//!
//! Invalid configuration fails fast in [`CaptureConfig::validate`], before any
//! capture begins.

use crate::error::{Result, TimeTravelError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Named configuration presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    Development,
    Staging,
    #[default]
    ProductionOptimized,
    ProductionExtended,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Development,
        Preset::Staging,
        Preset::ProductionOptimized,
        Preset::ProductionExtended,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Preset::Development => "development",
            Preset::Staging => "staging",
            Preset::ProductionOptimized => "production-optimized",
            Preset::ProductionExtended => "production-extended",
        }
    }

    /// (sampling rate, buffer capacity, state capture)
    pub fn defaults(self) -> (f64, usize, bool) {
        match self {
            Preset::Development => (1.0, 10_000, true),
            Preset::Staging => (0.5, 50_000, true),
            Preset::ProductionOptimized => (0.01, 10_000, false),
            Preset::ProductionExtended => (0.1, 100_000, true),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = TimeTravelError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Preset::ALL
            .into_iter()
            .find(|p| p.name() == normalized)
            .ok_or_else(|| TimeTravelError::ConfigurationInvalid(format!("unknown preset '{}'", s)))
    }
}

/// Adaptive sampler tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Floor for the adaptive rate (clamped to the configured sampling rate)
    pub min_rate: f64,
    /// Fill ratio above which the rate is cut
    pub high_watermark: f64,
    /// Fill ratio below which the rate may grow
    pub low_watermark: f64,
    /// Multiplicative decrease factor
    pub backoff_factor: f64,
    /// Additive increase step
    pub increase_step: f64,
    /// Resource pressure at or above which the rate is cut
    pub pressure_high: f64,
    /// Resource pressure at or below which resources count as plentiful
    pub pressure_low: f64,
    pub adjust_interval_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            min_rate: 0.01,
            high_watermark: 0.95,
            low_watermark: 0.80,
            backoff_factor: 0.5,
            increase_step: 0.05,
            pressure_high: 0.8,
            pressure_low: 0.5,
            adjust_interval_ms: 1_000,
        }
    }
}

impl SamplerConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }
}

/// Notification broadcaster tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Bounded queue size; the oldest update is dropped when full
    pub queue_capacity: usize,
    /// Flush as soon as this many updates are queued
    pub max_batch: usize,
    /// Flush at most this long after the first queued update
    pub flush_interval_ms: u64,
    /// Stats snapshot broadcast period, sent even when idle
    pub heartbeat_ms: u64,
    /// Per-subscriber delivery timeout
    pub send_timeout_ms: u64,
    /// Consecutive failures before a subscriber is unregistered
    pub max_consecutive_failures: u32,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            max_batch: 64,
            flush_interval_ms: 100,
            heartbeat_ms: 5_000,
            send_timeout_ms: 1_000,
            max_consecutive_failures: 3,
        }
    }
}

impl BroadcasterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Replay session tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Sessions without an advance for this long are cancelled and reclaimed
    pub idle_timeout_secs: u64,
    /// Terminal sessions are kept this long for status queries
    pub terminal_retention_secs: u64,
    /// Maximum lag behind the virtual clock before pacing re-anchors
    pub max_catch_up_ms: u64,
    /// Upper bound on a single pacing delay
    pub max_step_delay_ms: u64,
    /// Publish a progress update every N delivered events
    pub progress_every: u64,
    pub reap_interval_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            terminal_retention_secs: 60,
            max_catch_up_ms: 250,
            max_step_delay_ms: 5_000,
            progress_every: 100,
            reap_interval_ms: 1_000,
        }
    }
}

impl ReplayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }

    pub fn max_catch_up(&self) -> Duration {
        Duration::from_millis(self.max_catch_up_ms)
    }

    pub fn max_step_delay(&self) -> Duration {
        Duration::from_millis(self.max_step_delay_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Complete capture engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub preset: Preset,
    /// Master switch; when off every capture call returns immediately
    pub enabled: bool,
    /// Upper bound of the adaptive sampling rate, in [0, 1]
    pub sampling_rate: f64,
    /// Ring buffer slots (maximum resident events)
    pub buffer_capacity: usize,
    /// Ask messages to describe their variables
    pub capture_state: bool,
    /// Per-flow step cap, oldest steps evicted first
    pub max_steps_per_flow: usize,
    /// Variables are stripped from events estimated above this size
    pub max_event_bytes: usize,
    /// Time index bucket width
    pub time_bucket_ms: u64,
    /// Evict events older than this, if set
    pub retention_secs: Option<u64>,
    /// Growth-rate EWMA refresh period
    pub stats_tick_ms: u64,
    pub sampler: SamplerConfig,
    pub broadcaster: BroadcasterConfig,
    pub replay: ReplayConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::from_preset(Preset::default())
    }
}

/// Explicit per-field overrides applied on top of a preset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub enabled: Option<bool>,
    pub sampling_rate: Option<f64>,
    pub buffer_capacity: Option<usize>,
    pub capture_state: Option<bool>,
    pub max_steps_per_flow: Option<usize>,
    pub max_event_bytes: Option<usize>,
    pub time_bucket_ms: Option<u64>,
    pub retention_secs: Option<u64>,
    pub stats_tick_ms: Option<u64>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut CaptureConfig) {
        if let Some(v) = self.enabled {
            config.enabled = v;
        }
        if let Some(v) = self.sampling_rate {
            config.sampling_rate = v;
        }
        if let Some(v) = self.buffer_capacity {
            config.buffer_capacity = v;
        }
        if let Some(v) = self.capture_state {
            config.capture_state = v;
        }
        if let Some(v) = self.max_steps_per_flow {
            config.max_steps_per_flow = v;
        }
        if let Some(v) = self.max_event_bytes {
            config.max_event_bytes = v;
        }
        if let Some(v) = self.time_bucket_ms {
            config.time_bucket_ms = v;
        }
        if let Some(v) = self.retention_secs {
            config.retention_secs = Some(v);
        }
        if let Some(v) = self.stats_tick_ms {
            config.stats_tick_ms = v;
        }
    }
}

/// On-disk layout: a preset name, flat overrides and optional tuning sections
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    preset: Option<Preset>,
    #[serde(flatten)]
    overrides: ConfigOverrides,
    sampler: Option<SamplerConfig>,
    broadcaster: Option<BroadcasterConfig>,
    replay: Option<ReplayConfig>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_sections(self, config: &mut CaptureConfig) {
        self.overrides.apply(config);
        if let Some(sampler) = self.sampler {
            config.sampler = sampler;
        }
        if let Some(broadcaster) = self.broadcaster {
            config.broadcaster = broadcaster;
        }
        if let Some(replay) = self.replay {
            config.replay = replay;
        }
    }
}

impl CaptureConfig {
    pub fn from_preset(preset: Preset) -> Self {
        let (sampling_rate, buffer_capacity, capture_state) = preset.defaults();
        Self {
            preset,
            enabled: true,
            sampling_rate,
            buffer_capacity,
            capture_state,
            max_steps_per_flow: 1_000,
            max_event_bytes: 4 * 1024,
            time_bucket_ms: 1_000,
            retention_secs: None,
            stats_tick_ms: 1_000,
            sampler: SamplerConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            replay: ReplayConfig::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        overrides.apply(&mut self);
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = FileConfig::read(path.as_ref())?;
        let mut config = Self::from_preset(file.preset.unwrap_or_default());
        file.apply_sections(&mut config);
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - TIMETRAVEL_PRESET: preset name (default: production-optimized)
    /// - TIMETRAVEL_ENABLED: master capture switch
    /// - TIMETRAVEL_SAMPLING_RATE: sampling rate in [0, 1]
    /// - TIMETRAVEL_BUFFER_CAPACITY: ring buffer slots
    /// - TIMETRAVEL_CAPTURE_STATE: ask messages for variable snapshots
    /// - TIMETRAVEL_MAX_STEPS_PER_FLOW: per-flow step cap
    /// - TIMETRAVEL_RETENTION_SECS: evict events older than this
    pub fn from_env() -> Result<Self> {
        let (preset, overrides) = env_layer()?;
        Ok(Self::from_preset(preset.unwrap_or_default()).with_overrides(&overrides))
    }

    /// Load configuration with priority: env > file > preset, then validate
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let file = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading capture configuration from file: {:?}", path);
                FileConfig::read(path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using preset defaults", path);
                FileConfig::default()
            }
            None => FileConfig::default(),
        };

        let (env_preset, env_overrides) = env_layer()?;
        let preset = env_preset.or(file.preset).unwrap_or_default();

        let mut config = Self::from_preset(preset);
        file.apply_sections(&mut config);
        env_overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Upper bound on resident event memory
    pub fn memory_ceiling_bytes(&self) -> usize {
        self.buffer_capacity.saturating_mul(self.max_event_bytes)
    }

    pub fn time_bucket_us(&self) -> u64 {
        self.time_bucket_ms.saturating_mul(1_000)
    }

    pub fn stats_tick(&self) -> Duration {
        Duration::from_millis(self.stats_tick_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.sampling_rate.is_finite() || !(0.0..=1.0).contains(&self.sampling_rate) {
            return invalid(format!(
                "sampling_rate must be within [0, 1], got {}",
                self.sampling_rate
            ));
        }
        if self.buffer_capacity == 0 {
            return invalid("buffer_capacity must be positive");
        }
        if self.max_steps_per_flow == 0 {
            return invalid("max_steps_per_flow must be positive");
        }
        if self.max_event_bytes == 0 {
            return invalid("max_event_bytes must be positive");
        }
        if self.time_bucket_ms == 0 {
            return invalid("time_bucket_ms must be positive");
        }
        if self.stats_tick_ms == 0 {
            return invalid("stats_tick_ms must be positive");
        }
        if self.retention_secs == Some(0) {
            return invalid("retention_secs must be positive when set");
        }

        let s = &self.sampler;
        if !(0.0..=1.0).contains(&s.min_rate) {
            return invalid(format!("sampler.min_rate must be within [0, 1], got {}", s.min_rate));
        }
        if !(0.0 <= s.low_watermark && s.low_watermark < s.high_watermark && s.high_watermark <= 1.0)
        {
            return invalid(format!(
                "sampler watermarks must satisfy 0 <= low < high <= 1, got low={} high={}",
                s.low_watermark, s.high_watermark
            ));
        }
        if !(s.backoff_factor > 0.0 && s.backoff_factor < 1.0) {
            return invalid(format!(
                "sampler.backoff_factor must be within (0, 1), got {}",
                s.backoff_factor
            ));
        }
        if !(s.increase_step > 0.0 && s.increase_step <= 1.0) {
            return invalid(format!(
                "sampler.increase_step must be within (0, 1], got {}",
                s.increase_step
            ));
        }
        if !(0.0 <= s.pressure_low && s.pressure_low <= s.pressure_high) {
            return invalid("sampler pressure thresholds must satisfy 0 <= low <= high");
        }
        if s.adjust_interval_ms == 0 {
            return invalid("sampler.adjust_interval_ms must be positive");
        }

        let b = &self.broadcaster;
        if b.queue_capacity == 0 || b.max_batch == 0 {
            return invalid("broadcaster queue_capacity and max_batch must be positive");
        }
        if b.flush_interval_ms == 0 || b.heartbeat_ms == 0 || b.send_timeout_ms == 0 {
            return invalid("broadcaster intervals must be positive");
        }
        if b.max_consecutive_failures == 0 {
            return invalid("broadcaster.max_consecutive_failures must be positive");
        }

        let r = &self.replay;
        if r.idle_timeout_secs == 0 || r.reap_interval_ms == 0 || r.max_step_delay_ms == 0 {
            return invalid("replay timeouts must be positive");
        }
        if r.progress_every == 0 {
            return invalid("replay.progress_every must be positive");
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Result<()> {
    Err(TimeTravelError::ConfigurationInvalid(message.into()))
}

fn env_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            TimeTravelError::ConfigurationInvalid(format!("{} has invalid value '{}'", key, raw))
        }),
        Err(_) => Ok(None),
    }
}

fn env_layer() -> Result<(Option<Preset>, ConfigOverrides)> {
    let preset = env_var::<Preset>("TIMETRAVEL_PRESET")?;
    let overrides = ConfigOverrides {
        enabled: env_var("TIMETRAVEL_ENABLED")?,
        sampling_rate: env_var("TIMETRAVEL_SAMPLING_RATE")?,
        buffer_capacity: env_var("TIMETRAVEL_BUFFER_CAPACITY")?,
        capture_state: env_var("TIMETRAVEL_CAPTURE_STATE")?,
        max_steps_per_flow: env_var("TIMETRAVEL_MAX_STEPS_PER_FLOW")?,
        retention_secs: env_var("TIMETRAVEL_RETENTION_SECS")?,
        ..ConfigOverrides::default()
    };
    Ok((preset, overrides))
}
