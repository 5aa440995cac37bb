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

//! Composition root.
//!
//! [`TimeTravel`] wires the sampler, store, stats aggregator, replay engine,
//! broadcaster and capture interceptor together and owns the background
//! tasks:
//!
//! ```text
//! capture ──► Sampler ──► EventStore ──► Broadcaster ──► sinks
//!                            ▲   │            ▲
//!      maintenance loop ─────┘   └─► Replay ──┘
//!      (sampler adjust, stats tick, session reaper, retention sweep)
//! ```

use crate::capture::{CaptureInterceptor, CaptureOutcome, CaptureRequest};
use crate::replay::{AdvanceOutcome, ReplayEngine};
use parking_lot::Mutex;
use std::sync::Arc;
use timetravel_core::{
    now_us, AdaptiveSampler, Adjustment, CaptureConfig, CapturedEvent, DescribeVariables,
    EventId, FlowQuery, FlowSummary, NoPressure, PressureProbe, PressureSignals, ReplaySnapshot,
    Result, SessionId, StatsSnapshot, TimeTravelError,
};
use timetravel_observability::{
    Broadcaster, SubscriberId, Update, UpdateFilter, UpdateSink,
};
use timetravel_storage::{EventStore, StatsAggregator, StoreOptions};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TimeTravel {
    config: CaptureConfig,
    store: Arc<EventStore>,
    sampler: Arc<AdaptiveSampler>,
    broadcaster: Broadcaster,
    interceptor: CaptureInterceptor,
    replay: Arc<ReplayEngine>,
    pressure: Arc<dyn PressureProbe>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TimeTravel {
    /// Build every component from a validated configuration
    pub fn new(config: CaptureConfig) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(StatsAggregator::new());
        let store = Arc::new(EventStore::with_stats(
            StoreOptions::from_config(&config),
            stats,
        ));
        let sampler = Arc::new(AdaptiveSampler::new(
            config.sampling_rate,
            config.sampler.clone(),
        ));
        let broadcaster = Broadcaster::new(config.broadcaster.clone());
        let interceptor = CaptureInterceptor::new(
            Arc::clone(&sampler),
            Arc::clone(&store),
            config.enabled,
            config.capture_state,
        )
        .with_broadcaster(broadcaster.clone());
        let replay = Arc::new(
            ReplayEngine::new(Arc::clone(&store), config.replay.clone())
                .with_broadcaster(broadcaster.clone()),
        );

        info!(
            preset = %config.preset,
            sampling_rate = config.sampling_rate,
            buffer_capacity = config.buffer_capacity,
            capture_state = config.capture_state,
            memory_ceiling_bytes = config.memory_ceiling_bytes(),
            "Time-travel capture configured"
        );

        Ok(Self {
            config,
            store,
            sampler,
            broadcaster,
            interceptor,
            replay,
            pressure: Arc::new(NoPressure),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Use a host resource-pressure source for sampler adjustment
    pub fn with_pressure_probe(mut self, probe: Arc<dyn PressureProbe>) -> Self {
        self.pressure = probe;
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Spawn the broadcaster worker and the maintenance loop.
    ///
    /// Must be called from within a Tokio runtime. Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let heartbeat = {
            let stats = Arc::clone(self.store.stats());
            let broadcaster = self.broadcaster.clone();
            move || {
                let mut snapshot = stats.snapshot();
                snapshot.broadcast_dropped = broadcaster.dropped();
                Some(Update::Stats(snapshot))
            }
        };
        tasks.push(self.broadcaster.spawn(heartbeat, self.shutdown.child_token()));
        tasks.push(tokio::spawn(maintenance_loop(
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.sampler),
            Arc::clone(&self.replay),
            Arc::clone(&self.pressure),
            self.shutdown.child_token(),
        )));
        info!("Time-travel background tasks started");
    }

    /// Stop background tasks; queued updates are flushed first
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Time-travel shut down");
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    pub fn capture(
        &self,
        request: &CaptureRequest<'_>,
        describe: Option<&dyn DescribeVariables>,
    ) -> CaptureOutcome {
        self.interceptor.capture(request, describe)
    }

    pub fn interceptor(&self) -> &CaptureInterceptor {
        &self.interceptor
    }

    pub fn sampler(&self) -> &Arc<AdaptiveSampler> {
        &self.sampler
    }

    /// Run one sampler adjustment against the current fill ratio and pressure
    pub fn adjust_sampling(&self) -> Adjustment {
        self.sampler.adjust(PressureSignals {
            fill_ratio: self.store.fill_ratio(),
            resource_pressure: self.pressure.pressure(),
        })
    }

    // ------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn list_flows(&self, query: &FlowQuery) -> Vec<FlowSummary> {
        self.store.list_flows(query)
    }

    /// Resident events of a flow in per-flow sequence order
    pub fn get_flow(&self, correlation_id: &str) -> Result<Vec<Arc<CapturedEvent>>> {
        self.store
            .flow_events(correlation_id)
            .ok_or_else(|| TimeTravelError::FlowNotFound(correlation_id.to_string()))
    }

    pub fn flow_summary(&self, correlation_id: &str) -> Result<FlowSummary> {
        self.store
            .flow_summary(correlation_id)
            .ok_or_else(|| TimeTravelError::FlowNotFound(correlation_id.to_string()))
    }

    pub fn get_event(&self, id: EventId) -> Result<Arc<CapturedEvent>> {
        self.store.get(id).ok_or(TimeTravelError::EventNotFound(id))
    }

    /// Resident ancestors of an event, nearest first
    pub fn ancestors(&self, id: EventId, max_depth: usize) -> Result<Vec<Arc<CapturedEvent>>> {
        if self.store.get(id).is_none() {
            return Err(TimeTravelError::EventNotFound(id));
        }
        Ok(self.store.ancestors(id, max_depth))
    }

    pub fn events_in_range(
        &self,
        start_us: u64,
        end_us: u64,
        limit: usize,
    ) -> Result<Vec<Arc<CapturedEvent>>> {
        if start_us > end_us {
            return Err(TimeTravelError::InvalidRange { start_us, end_us });
        }
        Ok(self.store.events_in_range(start_us, end_us, limit))
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.store.snapshot();
        snapshot.broadcast_dropped = self.broadcaster.dropped();
        snapshot
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    pub fn replay(&self) -> &Arc<ReplayEngine> {
        &self.replay
    }

    pub fn start_system_replay(
        &self,
        start_us: u64,
        end_us: u64,
        speed: f64,
    ) -> Result<ReplaySnapshot> {
        self.replay.start_system(start_us, end_us, speed)
    }

    pub fn start_flow_replay(&self, correlation_id: &str, speed: f64) -> Result<ReplaySnapshot> {
        self.replay.start_flow(correlation_id, speed)
    }

    pub async fn advance(&self, id: SessionId) -> Result<AdvanceOutcome> {
        self.replay.advance(id).await
    }

    pub fn pause(&self, id: SessionId) -> Result<ReplaySnapshot> {
        self.replay.pause(id)
    }

    pub fn resume(&self, id: SessionId) -> Result<ReplaySnapshot> {
        self.replay.resume(id)
    }

    pub fn cancel(&self, id: SessionId) -> Result<ReplaySnapshot> {
        self.replay.cancel(id)
    }

    pub fn replay_snapshot(&self, id: SessionId) -> Result<ReplaySnapshot> {
        self.replay.snapshot(id)
    }

    pub fn list_replays(&self) -> Vec<ReplaySnapshot> {
        self.replay.list_sessions()
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn subscribe(&self, sink: Arc<dyn UpdateSink>) -> SubscriberId {
        self.broadcaster.subscribe(sink)
    }

    pub fn subscribe_with(&self, sink: Arc<dyn UpdateSink>, filter: UpdateFilter) -> SubscriberId {
        self.broadcaster.subscribe_with(sink, filter)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.broadcaster.unsubscribe(id)
    }
}

impl Drop for TimeTravel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Periodic sampler adjustment, stats tick, session reaping and retention
async fn maintenance_loop(
    config: CaptureConfig,
    store: Arc<EventStore>,
    sampler: Arc<AdaptiveSampler>,
    replay: Arc<ReplayEngine>,
    pressure: Arc<dyn PressureProbe>,
    shutdown: CancellationToken,
) {
    let mut adjust_tick = interval(config.sampler.adjust_interval());
    let mut stats_tick = interval(config.stats_tick());
    let mut reap_tick = interval(config.replay.reap_interval());
    for tick in [&mut adjust_tick, &mut stats_tick, &mut reap_tick] {
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }
    let retention = config.retention();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = adjust_tick.tick() => {
                sampler.adjust(PressureSignals {
                    fill_ratio: store.fill_ratio(),
                    resource_pressure: pressure.pressure(),
                });
            }

            _ = stats_tick.tick() => {
                store.stats().tick();
            }

            _ = reap_tick.tick() => {
                let reaped = replay.reap();
                if reaped > 0 {
                    debug!(reaped, "Reclaimed replay sessions");
                }
                if let Some(retention) = retention {
                    let cutoff = now_us().saturating_sub(retention.as_micros() as u64);
                    store.evict_older_than(cutoff);
                }
            }
        }
    }
    debug!("Maintenance loop stopped");
}
