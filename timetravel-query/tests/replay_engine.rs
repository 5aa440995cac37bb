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

//! Replay engine behaviour under a paused Tokio clock

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use timetravel_core::{
    BroadcasterConfig, EventDraft, ReplayConfig, ReplayMode, ReplayScope, ReplayStatus,
    TimeTravelError,
};
use timetravel_observability::{Broadcaster, CallbackSink, Update};
use timetravel_query::{AdvanceOutcome, ReplayEngine};
use timetravel_storage::{EventStore, StoreOptions};
use tokio::time::Instant;

const SECOND_US: u64 = 1_000_000;

fn store(capacity: usize) -> Arc<EventStore> {
    Arc::new(EventStore::new(StoreOptions::new(capacity)))
}

fn append(store: &EventStore, flow: &str, ts: u64) {
    assert!(store.append(EventDraft::new(flow, "Step", "svc", ts)).is_stored());
}

fn engine(store: &Arc<EventStore>) -> Arc<ReplayEngine> {
    Arc::new(ReplayEngine::new(Arc::clone(store), ReplayConfig::default()))
}

async fn expect_event(engine: &ReplayEngine, id: timetravel_core::SessionId) -> u64 {
    match engine.advance(id).await.unwrap() {
        AdvanceOutcome::Event(step) => step.event.timestamp_us,
        other => panic!("expected an event, got {:?}", other),
    }
}

/// Gaps between events are scaled by the replay speed
#[tokio::test(start_paused = true)]
async fn advance_paces_by_speed() {
    let store = store(16);
    for i in 0..3 {
        append(&store, "order-1", 10 * SECOND_US + i * SECOND_US);
    }
    let engine = engine(&store);
    let session = engine.start_flow("order-1", 2.0).unwrap();

    let started = Instant::now();
    expect_event(&engine, session.id).await;
    assert_eq!(started.elapsed(), Duration::ZERO);

    expect_event(&engine, session.id).await;
    expect_event(&engine, session.id).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1_000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1_100), "{:?}", elapsed);
}

/// Long idle stretches are compressed to the step cap
#[tokio::test(start_paused = true)]
async fn long_gaps_are_capped() {
    let store = store(16);
    append(&store, "order-1", SECOND_US);
    append(&store, "order-1", 3_600 * SECOND_US);
    let engine = engine(&store);
    let session = engine.start_flow("order-1", 1.0).unwrap();

    let started = Instant::now();
    expect_event(&engine, session.id).await;
    expect_event(&engine, session.id).await;
    assert!(started.elapsed() <= Duration::from_millis(5_100));
}

/// System replay merges flows by timestamp and ignores later captures
#[tokio::test(start_paused = true)]
async fn system_replay_orders_across_flows() {
    let store = store(64);
    append(&store, "b", 3_000);
    append(&store, "a", 1_000);
    append(&store, "c", 2_000);
    append(&store, "a", 50_000);
    let engine = engine(&store);

    let session = engine.start_system(0, 10_000, 1_000.0).unwrap();
    assert_eq!(session.mode, ReplayMode::System);
    assert_eq!(session.scope, ReplayScope::TimeRange { start_us: 0, end_us: 10_000 });
    assert_eq!(session.total, 3);

    append(&store, "late", 1_500);

    let mut stamps = Vec::new();
    for _ in 0..3 {
        stamps.push(expect_event(&engine, session.id).await);
    }
    assert_eq!(stamps, vec![1_000, 2_000, 3_000]);
    assert_eq!(engine.snapshot(session.id).unwrap().status, ReplayStatus::Completed);
}

/// Events evicted mid-replay are skipped and the session ends with a gap
#[tokio::test(start_paused = true)]
async fn evicted_events_end_with_gap() {
    let store = store(4);
    for i in 1..=3 {
        append(&store, "a", i * 1_000);
    }
    let engine = engine(&store);
    let session = engine.start_flow("a", 1_000.0).unwrap();
    assert_eq!(session.total, 3);

    // Wraps the ring over a's first two events
    for i in 1..=3 {
        append(&store, "b", 10_000 + i);
    }

    match engine.advance(session.id).await.unwrap() {
        AdvanceOutcome::Event(step) => {
            assert_eq!(step.event.flow_seq, 3);
            assert_eq!(step.position, 3);
            assert_eq!(step.skipped, 2);
        }
        other => panic!("expected an event, got {:?}", other),
    }

    let snapshot = engine.snapshot(session.id).unwrap();
    assert_eq!(snapshot.status, ReplayStatus::FailedWithGap);
    assert_eq!(snapshot.delivered, 1);
    assert_eq!(snapshot.skipped, 2);
    assert!(matches!(
        snapshot.ensure_complete(),
        Err(TimeTravelError::ReplayGap { skipped: 2, .. })
    ));
}

/// Pausing interrupts a pending wait and keeps the event for later
#[tokio::test(start_paused = true)]
async fn pause_interrupts_and_resume_continues() {
    let store = store(16);
    append(&store, "a", SECOND_US);
    append(&store, "a", 2 * SECOND_US);
    let engine = engine(&store);
    let session = engine.start_flow("a", 1.0).unwrap();
    expect_event(&engine, session.id).await;

    let waiting = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.advance(session.id).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let paused = engine.pause(session.id).unwrap();
    assert_eq!(paused.status, ReplayStatus::Paused);
    assert!(matches!(
        waiting.await.unwrap().unwrap(),
        AdvanceOutcome::Paused(_)
    ));
    assert!(matches!(
        engine.advance(session.id).await.unwrap(),
        AdvanceOutcome::Paused(_)
    ));

    assert_eq!(engine.resume(session.id).unwrap().status, ReplayStatus::Running);
    let resumed = Instant::now();
    assert_eq!(expect_event(&engine, session.id).await, 2 * SECOND_US);
    assert_eq!(resumed.elapsed(), Duration::ZERO);

    let snapshot = engine.snapshot(session.id).unwrap();
    assert_eq!(snapshot.status, ReplayStatus::Completed);
    assert_eq!(snapshot.delivered, 2);
}

/// Cancellation is terminal
#[tokio::test(start_paused = true)]
async fn cancel_is_terminal() {
    let store = store(16);
    append(&store, "a", SECOND_US);
    append(&store, "a", 2 * SECOND_US);
    let engine = engine(&store);
    let session = engine.start_flow("a", 1.0).unwrap();

    assert_eq!(engine.cancel(session.id).unwrap().status, ReplayStatus::Cancelled);
    assert!(matches!(
        engine.advance(session.id).await.unwrap(),
        AdvanceOutcome::Cancelled(_)
    ));
    assert!(matches!(
        engine.pause(session.id),
        Err(TimeTravelError::InvalidTransition(_))
    ));
    assert!(matches!(
        engine.resume(session.id),
        Err(TimeTravelError::InvalidTransition(_))
    ));
    assert!(matches!(
        engine.cancel(session.id),
        Err(TimeTravelError::InvalidTransition(_))
    ));
}

/// Empty scopes complete immediately; bad input is rejected up front
#[tokio::test(start_paused = true)]
async fn start_validation() {
    let store = store(16);
    append(&store, "a", SECOND_US);
    let engine = engine(&store);

    let empty = engine.start_system(5 * SECOND_US, 6 * SECOND_US, 1.0).unwrap();
    assert_eq!(empty.status, ReplayStatus::Completed);
    assert_eq!(empty.total, 0);
    assert!(matches!(
        engine.advance(empty.id).await.unwrap(),
        AdvanceOutcome::Completed(_)
    ));

    assert!(matches!(
        engine.start_flow("missing", 1.0),
        Err(TimeTravelError::FlowNotFound(_))
    ));
    for speed in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            engine.start_flow("a", speed),
            Err(TimeTravelError::InvalidSpeed(_))
        ));
    }
    assert!(matches!(
        engine.start_system(10, 5, 1.0),
        Err(TimeTravelError::InvalidRange { start_us: 10, end_us: 5 })
    ));
    assert!(matches!(
        engine.snapshot(uuid_nil()),
        Err(TimeTravelError::SessionNotFound(_))
    ));
}

fn uuid_nil() -> timetravel_core::SessionId {
    timetravel_core::SessionId::nil()
}

/// Idle sessions are cancelled and finished ones reclaimed after retention
#[tokio::test(start_paused = true)]
async fn reaper_reclaims_sessions() {
    let store = store(16);
    append(&store, "a", SECOND_US);
    let config = ReplayConfig {
        idle_timeout_secs: 10,
        terminal_retention_secs: 30,
        ..Default::default()
    };
    let engine = ReplayEngine::new(Arc::clone(&store), config);

    let idle = engine.start_flow("a", 1.0).unwrap();
    let finished = engine.start_flow("a", 1.0).unwrap();
    expect_event(&engine, finished.id).await;
    assert_eq!(engine.session_count(), 2);

    assert_eq!(engine.reap(), 0);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(engine.reap(), 1);
    assert!(matches!(
        engine.snapshot(idle.id),
        Err(TimeTravelError::SessionNotFound(_))
    ));
    assert_eq!(
        engine.snapshot(finished.id).unwrap().status,
        ReplayStatus::Completed
    );

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(engine.reap(), 1);
    assert_eq!(engine.session_count(), 0);
}

/// Status changes are published as progress updates
#[tokio::test(start_paused = true)]
async fn progress_is_published() {
    let store = store(16);
    append(&store, "a", SECOND_US);
    append(&store, "a", SECOND_US + 1);

    let broadcaster = Broadcaster::new(BroadcasterConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = Arc::clone(&seen);
        CallbackSink::new("progress", move |batch: &timetravel_observability::UpdateBatch| {
            for update in &batch.updates {
                if let Update::ReplayProgress(snapshot) = update {
                    seen.lock().push(snapshot.status);
                }
            }
            Ok(())
        })
    };
    broadcaster.subscribe(Arc::new(sink));

    let engine = ReplayEngine::new(Arc::clone(&store), ReplayConfig::default())
        .with_broadcaster(broadcaster.clone());
    let session = engine.start_flow("a", 1_000.0).unwrap();
    expect_event(&engine, session.id).await;
    expect_event(&engine, session.id).await;
    broadcaster.flush().await;
    assert!(broadcaster.wait_delivered(Duration::from_secs(5)).await);

    assert_eq!(
        *seen.lock(),
        vec![
            ReplayStatus::Pending,
            ReplayStatus::Running,
            ReplayStatus::Completed
        ]
    );
}
