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

//! End-to-end scenarios through the `TimeTravel` composition root

use std::sync::Arc;
use std::time::Duration;
use timetravel_core::{
    CaptureConfig, DescribeVariables, EventId, FlowQuery, Preset, ReplayStatus,
    SamplingHint, SamplingMetadata, StatsSnapshot, TimeTravelError, VariableSnapshot,
};
use timetravel_observability::{ChannelSink, Update, UpdateFilter, UpdateKind};
use timetravel_query::{AdvanceOutcome, CaptureOutcome, CaptureRequest, TimeTravel};

fn config(capacity: usize, rate: f64) -> CaptureConfig {
    let mut config = CaptureConfig::from_preset(Preset::Development);
    config.buffer_capacity = capacity;
    config.sampling_rate = rate;
    config
}

fn engine(capacity: usize, rate: f64) -> TimeTravel {
    TimeTravel::new(config(capacity, rate)).unwrap()
}

fn capture_at(engine: &TimeTravel, cid: &str, ts: u64) -> EventId {
    engine
        .capture(&CaptureRequest::new(cid, "Step", "svc").at(ts), None)
        .id()
        .expect("event captured")
}

struct Order {
    total: u64,
}

impl DescribeVariables for Order {
    fn describe_variables(&self, snapshot: &mut VariableSnapshot) {
        snapshot.insert("total".into(), self.total.into());
    }
}

/// Oldest events of a flow are evicted once the ring wraps
#[test]
fn capacity_eviction_keeps_latest_flow_steps() {
    let engine = engine(3, 1.0);
    for ts in 1..=4 {
        capture_at(&engine, "order-1", ts * 1_000);
    }

    let flow = engine.get_flow("order-1").unwrap();
    let seqs: Vec<u64> = flow.iter().map(|e| e.flow_seq).collect();
    assert_eq!(seqs, vec![2, 3, 4]);
    assert_eq!(engine.flow_summary("order-1").unwrap().event_count, 3);

    let stats = engine.stats();
    assert_eq!(stats.total_events_lifetime, 4);
    assert_eq!(stats.events_currently_stored, 3);
}

/// A zero sampling rate captures nothing
#[test]
fn zero_rate_captures_nothing() {
    let engine = engine(100, 0.0);
    for i in 0..1000 {
        let cid = format!("flow-{}", i);
        let outcome = engine.capture(&CaptureRequest::new(&cid, "Step", "svc"), None);
        assert_eq!(outcome, CaptureOutcome::SampledOut);
    }

    let stats = engine.stats();
    assert_eq!(stats.total_events_lifetime, 0);
    assert_eq!(stats.events_currently_stored, 0);
    assert_eq!(stats.sampled_out, 1000);
    assert!(engine.list_flows(&FlowQuery::new()).is_empty());
}

/// Full sampling keeps every flow whole
#[test]
fn full_rate_keeps_every_flow() {
    let engine = engine(100, 1.0);
    for flow in 0..5 {
        let cid = format!("flow-{}", flow);
        for step in 0..10 {
            capture_at(&engine, &cid, 1_000 + flow * 100 + step);
        }
    }

    let flows = engine.list_flows(&FlowQuery::new());
    assert_eq!(flows.len(), 5);
    assert!(flows.iter().all(|f| f.event_count == 10));
    assert_eq!(engine.stats().total_events_lifetime, 50);
    assert_eq!(engine.stats().flows_currently_tracked, 5);
}

/// Sampling hints override the rate in both directions
#[test]
fn sampling_hints_override_rate() {
    let engine = engine(100, 0.0);
    let always = SamplingMetadata::with_hint(SamplingHint::Always);
    let outcome = engine.capture(
        &CaptureRequest::new("vip", "Step", "svc").sampling(always),
        None,
    );
    assert!(outcome.is_captured());

    let engine = engine_full();
    let never = SamplingMetadata::with_hint(SamplingHint::Never);
    let outcome = engine.capture(
        &CaptureRequest::new("noisy", "Step", "svc").sampling(never),
        None,
    );
    assert_eq!(outcome, CaptureOutcome::SampledOut);
}

fn engine_full() -> TimeTravel {
    engine(100, 1.0)
}

/// Variables are captured only when state capture is on
#[test]
fn variables_follow_capture_state() {
    let engine = engine_full();
    let id = engine
        .capture(
            &CaptureRequest::new("order-1", "OrderPlaced", "checkout"),
            Some(&Order { total: 42 }),
        )
        .id()
        .unwrap();
    let event = engine.get_event(id).unwrap();
    assert_eq!(event.variables.as_ref().unwrap()["total"], 42);

    let mut cfg = config(100, 1.0);
    cfg.capture_state = false;
    let engine = TimeTravel::new(cfg).unwrap();
    let id = engine
        .capture(
            &CaptureRequest::new("order-1", "OrderPlaced", "checkout"),
            Some(&Order { total: 42 }),
        )
        .id()
        .unwrap();
    assert!(engine.get_event(id).unwrap().variables.is_none());
}

/// Disabled capture is a no-op
#[test]
fn disabled_capture_is_noop() {
    let engine = engine_full();
    engine.interceptor().set_enabled(false);
    let outcome = engine.capture(&CaptureRequest::new("order-1", "Step", "svc"), None);
    assert_eq!(outcome, CaptureOutcome::Disabled);
    assert_eq!(engine.stats().total_events_lifetime, 0);
}

/// Query errors name what is missing
#[test]
fn query_errors() {
    let engine = engine_full();
    assert!(matches!(
        engine.get_flow("missing"),
        Err(TimeTravelError::FlowNotFound(cid)) if cid == "missing"
    ));
    assert!(matches!(
        engine.get_event(EventId(7)),
        Err(TimeTravelError::EventNotFound(EventId(7)))
    ));
    assert!(matches!(
        engine.events_in_range(10, 5, 100),
        Err(TimeTravelError::InvalidRange { start_us: 10, end_us: 5 })
    ));
    assert!(matches!(
        engine.ancestors(EventId(3), 4),
        Err(TimeTravelError::EventNotFound(_))
    ));
}

/// Causal chains are walked through parent links
#[test]
fn ancestors_follow_parent_links() {
    let engine = engine_full();
    let root = capture_at(&engine, "order-1", 1_000);
    let child = engine
        .capture(
            &CaptureRequest::new("order-1", "Reserve", "inventory")
                .at(2_000)
                .parent(root),
            None,
        )
        .id()
        .unwrap();
    let leaf = engine
        .capture(
            &CaptureRequest::new("order-1", "Charge", "payments")
                .at(3_000)
                .parent(child),
            None,
        )
        .id()
        .unwrap();

    let chain: Vec<EventId> = engine
        .ancestors(leaf, 10)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(chain, vec![child, root]);
    assert_eq!(engine.ancestors(leaf, 1).unwrap().len(), 1);

    let summary = engine.flow_summary("order-1").unwrap();
    assert_eq!(summary.services, vec!["svc", "inventory", "payments"]);
}

/// Range queries return events in timestamp order
#[test]
fn range_query_orders_by_timestamp() {
    let engine = engine_full();
    capture_at(&engine, "b", 3_000);
    capture_at(&engine, "a", 1_000);
    capture_at(&engine, "c", 2_000);
    capture_at(&engine, "a", 9_000);

    let events = engine.events_in_range(1_000, 3_000, 100).unwrap();
    let stamps: Vec<u64> = events.iter().map(|e| e.timestamp_us).collect();
    assert_eq!(stamps, vec![1_000, 2_000, 3_000]);
    assert_eq!(engine.events_in_range(0, 10_000, 2).unwrap().len(), 2);
}

/// A fast flow replay completes in exactly as many advances as events
#[tokio::test(start_paused = true)]
async fn flow_replay_completes_after_each_event() {
    let engine = engine_full();
    for step in 0..5 {
        capture_at(&engine, "order-1", 1_000_000 + step * 1_000);
    }

    let session = engine.start_flow_replay("order-1", 1000.0).unwrap();
    assert_eq!(session.total, 5);

    let mut seqs = Vec::new();
    for _ in 0..5 {
        match engine.advance(session.id).await.unwrap() {
            AdvanceOutcome::Event(step) => seqs.push(step.event.flow_seq),
            other => panic!("expected an event, got {:?}", other),
        }
    }
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    let snapshot = engine.replay_snapshot(session.id).unwrap();
    assert_eq!(snapshot.status, ReplayStatus::Completed);
    assert_eq!(snapshot.delivered, 5);
    assert!(matches!(
        engine.advance(session.id).await.unwrap(),
        AdvanceOutcome::Completed(_)
    ));
}

/// A subscriber that never drains costs dropped updates, never a blocked publisher
#[test]
fn undrained_subscriber_drops_updates() {
    let mut cfg = config(100, 1.0);
    cfg.broadcaster.queue_capacity = 10;
    let engine = TimeTravel::new(cfg).unwrap();
    let (sink, _rx) = ChannelSink::new("viewer", 1);
    engine.subscribe(Arc::new(sink));

    for n in 0..1000 {
        engine.broadcaster().publish(Update::Stats(StatsSnapshot {
            total_events_lifetime: n,
            ..Default::default()
        }));
    }

    assert_eq!(engine.broadcaster().queue_len(), 10);
    assert_eq!(engine.stats().broadcast_dropped, 990);
}

/// Captures reach subscribers as flow updates once the worker runs
#[tokio::test]
async fn captures_are_broadcast_to_subscribers() {
    let mut cfg = config(100, 1.0);
    cfg.broadcaster.flush_interval_ms = 10;
    let engine = TimeTravel::new(cfg).unwrap();
    let (sink, mut rx) = ChannelSink::new("viewer", 16);
    engine.subscribe_with(Arc::new(sink), UpdateFilter::only(&[UpdateKind::Flow]));
    engine.start();

    capture_at(&engine, "order-1", 1_000);

    let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("batch delivered")
        .expect("channel open");
    match &batch.updates[0] {
        Update::FlowUpdated(summary) => assert_eq!(summary.correlation_id, "order-1"),
        other => panic!("unexpected update {:?}", other),
    }

    engine.shutdown().await;
}

/// Invalid configuration is rejected before anything is built
#[test]
fn invalid_config_is_rejected() {
    let mut cfg = config(100, 1.0);
    cfg.buffer_capacity = 0;
    assert!(matches!(
        TimeTravel::new(cfg),
        Err(TimeTravelError::ConfigurationInvalid(_))
    ));

    let cfg = config(100, 1.5);
    assert!(TimeTravel::new(cfg).is_err());
}

/// Fill pressure lowers the sampling rate through the composition root
#[test]
fn adjust_sampling_reacts_to_fill() {
    let engine = engine(10, 1.0);
    for ts in 0..10 {
        capture_at(&engine, &format!("flow-{}", ts), ts + 1);
    }
    assert_eq!(engine.store().fill_ratio(), 1.0);

    engine.adjust_sampling();
    assert_eq!(engine.sampler().rate(), 0.5);
}
