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

//! Replay Engine
//!
//! Replay sessions are independent read-only cursors over the store. A session
//! freezes its scope when it starts:
//! - system replay: events in `[start_us, end_us]` whose global sequence is
//!   below the write cursor at start, merged across time-index shards in
//!   `(timestamp, global_seq)` order
//! - flow replay: the flow's member list at start, in per-flow sequence order
//!
//! Events evicted before the cursor reaches them are counted as skipped; the
//! session keeps going and ends as `FailedWithGap` instead of `Completed`.
//!
//! `advance` is the only suspending call: it sleeps to pace emission against
//! the session's virtual clock. Pause and cancel interrupt a pending sleep.

use crate::merge::{system_scan, SystemScan};
use crate::pacing::Pacer;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use timetravel_core::{
    CapturedEvent, EventId, ReplayCommand, ReplayConfig, ReplayMode, ReplayScope, ReplaySnapshot,
    ReplayStatus, Result, SessionId, TimeTravelError,
};
use timetravel_observability::{Broadcaster, Update};
use timetravel_storage::EventStore;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// One delivered replay event
#[derive(Debug, Clone)]
pub struct ReplayStep {
    pub event: Arc<CapturedEvent>,
    /// 1-based position within the session scope, skipped events included
    pub position: u64,
    /// Events skipped so far
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    Event(ReplayStep),
    Completed(ReplaySnapshot),
    Paused(ReplaySnapshot),
    Cancelled(ReplaySnapshot),
}

impl AdvanceOutcome {
    pub fn event(&self) -> Option<&Arc<CapturedEvent>> {
        match self {
            AdvanceOutcome::Event(step) => Some(&step.event),
            _ => None,
        }
    }
}

enum Source {
    Flow(VecDeque<EventId>),
    System(Box<SystemScan>),
}

impl Source {
    fn next_id(&mut self) -> Option<EventId> {
        match self {
            Source::Flow(ids) => ids.pop_front(),
            Source::System(scan) => scan.next().map(|key| key.id),
        }
    }
}

struct Cursor {
    source: Source,
    /// Next event to emit, already read from the store
    pending: Option<Arc<CapturedEvent>>,
    pacer: Pacer,
}

struct SessionState {
    status: ReplayStatus,
    /// Scope size counted at start; raised if the scan yields more
    total: u64,
    delivered: u64,
    skipped: u64,
    position: u64,
    last_activity: Instant,
    finished_at: Option<Instant>,
    /// Restart the virtual clock on the next advance
    reanchor: bool,
}

struct ReplaySession {
    id: SessionId,
    mode: ReplayMode,
    scope: ReplayScope,
    speed: f64,
    state: Mutex<SessionState>,
    cursor: tokio::sync::Mutex<Cursor>,
    interrupt: Notify,
}

impl ReplaySession {
    fn snapshot(&self) -> ReplaySnapshot {
        let state = self.state.lock();
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &SessionState) -> ReplaySnapshot {
        ReplaySnapshot {
            id: self.id,
            mode: self.mode,
            scope: self.scope.clone(),
            speed: self.speed,
            status: state.status,
            total: state.total,
            delivered: state.delivered,
            skipped: state.skipped,
            position: state.position,
        }
    }

    fn status(&self) -> ReplayStatus {
        self.state.lock().status
    }
}

pub struct ReplayEngine {
    store: Arc<EventStore>,
    config: ReplayConfig,
    sessions: DashMap<SessionId, Arc<ReplaySession>>,
    broadcaster: Option<Broadcaster>,
}

impl ReplayEngine {
    pub fn new(store: Arc<EventStore>, config: ReplayConfig) -> Self {
        Self {
            store,
            config,
            sessions: DashMap::new(),
            broadcaster: None,
        }
    }

    /// Publish session progress to live subscribers
    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Start replaying every event in `[start_us, end_us]` across all flows
    pub fn start_system(&self, start_us: u64, end_us: u64, speed: f64) -> Result<ReplaySnapshot> {
        validate_speed(speed)?;
        if start_us > end_us {
            return Err(TimeTravelError::InvalidRange { start_us, end_us });
        }

        let bound = self.store.cursor();
        let total = self.store.count_range_before(start_us, end_us, bound);
        let source = Source::System(Box::new(system_scan(&self.store, start_us, end_us, bound)));
        Ok(self.open(
            ReplayMode::System,
            ReplayScope::TimeRange { start_us, end_us },
            speed,
            total,
            source,
        ))
    }

    /// Start replaying one flow in per-flow sequence order
    pub fn start_flow(&self, correlation_id: &str, speed: f64) -> Result<ReplaySnapshot> {
        validate_speed(speed)?;
        let members = self
            .store
            .flow_members(correlation_id)
            .ok_or_else(|| TimeTravelError::FlowNotFound(correlation_id.to_string()))?;

        let total = members.len() as u64;
        Ok(self.open(
            ReplayMode::Flow,
            ReplayScope::Flow {
                correlation_id: correlation_id.to_string(),
            },
            speed,
            total,
            Source::Flow(members.into()),
        ))
    }

    fn open(
        &self,
        mode: ReplayMode,
        scope: ReplayScope,
        speed: f64,
        total: u64,
        source: Source,
    ) -> ReplaySnapshot {
        let id = SessionId::new_v4();
        let now = Instant::now();
        let empty = total == 0;

        let session = Arc::new(ReplaySession {
            id,
            mode,
            scope,
            speed,
            state: Mutex::new(SessionState {
                status: if empty {
                    ReplayStatus::Completed
                } else {
                    ReplayStatus::Pending
                },
                total,
                delivered: 0,
                skipped: 0,
                position: 0,
                last_activity: now,
                finished_at: empty.then_some(now),
                reanchor: false,
            }),
            cursor: tokio::sync::Mutex::new(Cursor {
                source,
                pending: None,
                pacer: Pacer::new(
                    speed,
                    self.config.max_catch_up(),
                    self.config.max_step_delay(),
                ),
            }),
            interrupt: Notify::new(),
        });

        let snapshot = session.snapshot();
        self.sessions.insert(id, session);
        info!(session = %id, ?mode, total, speed, "Replay session started");
        self.publish(&snapshot);
        snapshot
    }

    fn session(&self, id: SessionId) -> Result<Arc<ReplaySession>> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TimeTravelError::SessionNotFound(id))
    }

    /// Emit the next event of the session, waiting for its pacing delay.
    ///
    /// Calls on the same session are serialized.
    pub async fn advance(&self, id: SessionId) -> Result<AdvanceOutcome> {
        let session = self.session(id)?;
        let mut guard = session.cursor.lock().await;
        let cursor = &mut *guard;

        let (started, reanchor) = {
            let mut state = session.state.lock();
            state.last_activity = Instant::now();
            match state.status {
                ReplayStatus::Paused => {
                    return Ok(AdvanceOutcome::Paused(session.snapshot_of(&state)))
                }
                ReplayStatus::Cancelled => {
                    return Ok(AdvanceOutcome::Cancelled(session.snapshot_of(&state)))
                }
                ReplayStatus::Completed | ReplayStatus::FailedWithGap => {
                    return Ok(AdvanceOutcome::Completed(session.snapshot_of(&state)))
                }
                ReplayStatus::Pending | ReplayStatus::Running => {}
            }
            let previous = state.status;
            state.status = previous.transition(ReplayCommand::Advance)?;
            (
                previous != state.status,
                std::mem::take(&mut state.reanchor),
            )
        };
        if started {
            self.publish(&session.snapshot());
        }
        if reanchor {
            cursor.pacer.reset();
        }

        let next = match cursor.pending.take() {
            Some(event) => Some(event),
            None => self.next_available(&mut cursor.source, &session),
        };
        let Some(event) = next else {
            let snapshot = self.finish(&session);
            return Ok(terminal_outcome(snapshot));
        };

        let delay = cursor.pacer.delay_for(event.timestamp_us, Instant::now());
        if !delay.is_zero() {
            let interrupted = session.interrupt.notified();
            tokio::pin!(interrupted);
            interrupted.as_mut().enable();
            if matches!(session.status(), ReplayStatus::Running) {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut interrupted => {}
                }
            }

            match session.status() {
                ReplayStatus::Paused => {
                    cursor.pending = Some(event);
                    cursor.pacer.reset();
                    return Ok(AdvanceOutcome::Paused(session.snapshot()));
                }
                ReplayStatus::Cancelled => {
                    return Ok(AdvanceOutcome::Cancelled(session.snapshot()));
                }
                _ => {}
            }
        }

        let (position, delivered) = {
            let mut state = session.state.lock();
            state.delivered += 1;
            state.position += 1;
            state.total = state.total.max(state.position);
            state.last_activity = Instant::now();
            (state.position, state.delivered)
        };
        trace!(session = %id, position, event = %event.id, "Replay step");

        cursor.pending = self.next_available(&mut cursor.source, &session);
        let skipped = if cursor.pending.is_none() {
            self.finish(&session).skipped
        } else {
            let every = self.config.progress_every;
            if every > 0 && delivered % every == 0 {
                self.publish(&session.snapshot());
            }
            session.state.lock().skipped
        };

        Ok(AdvanceOutcome::Event(ReplayStep {
            event,
            position,
            skipped,
        }))
    }

    /// Next resident event of the scope, counting evicted ones as skipped
    fn next_available(
        &self,
        source: &mut Source,
        session: &ReplaySession,
    ) -> Option<Arc<CapturedEvent>> {
        loop {
            let id = source.next_id()?;
            if let Some(event) = self.store.get(id) {
                return Some(event);
            }
            let mut state = session.state.lock();
            state.skipped += 1;
            state.position += 1;
            state.total = state.total.max(state.position);
            trace!(session = %session.id, event = %id, "Replay skipped evicted event");
        }
    }

    /// Move an exhausted session to its terminal status
    fn finish(&self, session: &ReplaySession) -> ReplaySnapshot {
        let snapshot = {
            let mut state = session.state.lock();
            if !state.status.is_terminal() {
                // Evictions the scan never saw are gaps too
                state.total = state.total.max(state.position);
                state.skipped = state.total.saturating_sub(state.delivered);
                state.position = state.delivered + state.skipped;
                let gap = state.skipped > 0;
                if let Ok(next) = state.status.transition(ReplayCommand::Exhaust { gap }) {
                    state.status = next;
                    state.finished_at = Some(Instant::now());
                }
            }
            session.snapshot_of(&state)
        };

        match snapshot.status {
            ReplayStatus::FailedWithGap => warn!(
                session = %session.id,
                delivered = snapshot.delivered,
                skipped = snapshot.skipped,
                "Replay finished with gaps"
            ),
            _ => info!(
                session = %session.id,
                delivered = snapshot.delivered,
                "Replay finished"
            ),
        }
        self.publish(&snapshot);
        snapshot
    }

    fn command(&self, id: SessionId, command: ReplayCommand) -> Result<ReplaySnapshot> {
        let session = self.session(id)?;
        let (snapshot, changed) = {
            let mut state = session.state.lock();
            let previous = state.status;
            state.status = previous.transition(command)?;
            state.last_activity = Instant::now();
            match command {
                ReplayCommand::Resume => state.reanchor = true,
                ReplayCommand::Cancel | ReplayCommand::Expire => {
                    state.finished_at = Some(Instant::now())
                }
                _ => {}
            }
            (session.snapshot_of(&state), previous != state.status)
        };

        session.interrupt.notify_waiters();
        if changed {
            debug!(session = %id, status = ?snapshot.status, "Replay status changed");
            self.publish(&snapshot);
        }
        Ok(snapshot)
    }

    pub fn pause(&self, id: SessionId) -> Result<ReplaySnapshot> {
        self.command(id, ReplayCommand::Pause)
    }

    pub fn resume(&self, id: SessionId) -> Result<ReplaySnapshot> {
        self.command(id, ReplayCommand::Resume)
    }

    pub fn cancel(&self, id: SessionId) -> Result<ReplaySnapshot> {
        self.command(id, ReplayCommand::Cancel)
    }

    pub fn snapshot(&self, id: SessionId) -> Result<ReplaySnapshot> {
        Ok(self.session(id)?.snapshot())
    }

    pub fn list_sessions(&self) -> Vec<ReplaySnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel idle sessions and reclaim finished ones
    pub fn reap(&self) -> usize {
        self.reap_at(Instant::now())
    }

    pub fn reap_at(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let retention = self.config.terminal_retention();
        let mut reclaim = Vec::new();
        let mut expired = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let mut state = session.state.lock();
            if state.status.is_terminal() {
                let finished = state.finished_at.unwrap_or(state.last_activity);
                if now.saturating_duration_since(finished) >= retention {
                    reclaim.push(session.id);
                }
            } else if now.saturating_duration_since(state.last_activity) >= idle_timeout {
                if let Ok(next) = state.status.transition(ReplayCommand::Expire) {
                    state.status = next;
                    state.finished_at = Some(now);
                }
                session.interrupt.notify_waiters();
                expired.push(session.snapshot_of(&state));
                reclaim.push(session.id);
            }
        }

        for snapshot in &expired {
            info!(session = %snapshot.id, "Idle replay session cancelled");
            self.publish(snapshot);
        }
        for id in &reclaim {
            self.sessions.remove(id);
        }
        reclaim.len()
    }

    fn publish(&self, snapshot: &ReplaySnapshot) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(Update::ReplayProgress(snapshot.clone()));
        }
    }
}

fn terminal_outcome(snapshot: ReplaySnapshot) -> AdvanceOutcome {
    match snapshot.status {
        ReplayStatus::Cancelled => AdvanceOutcome::Cancelled(snapshot),
        ReplayStatus::Paused => AdvanceOutcome::Paused(snapshot),
        _ => AdvanceOutcome::Completed(snapshot),
    }
}

fn validate_speed(speed: f64) -> Result<()> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(TimeTravelError::InvalidSpeed(speed))
    }
}
