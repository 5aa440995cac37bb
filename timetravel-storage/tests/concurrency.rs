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

//! Concurrent writer and reader tests for the event store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use timetravel_core::{EventDraft, EventId};
use timetravel_storage::{AppendOutcome, EventStore, StoreOptions};

const WRITERS: usize = 8;
const PER_WRITER: usize = 5_000;

/// Many writers on a small ring: every append is either stored or accounted as dropped
#[test]
fn test_concurrent_appends_keep_accounting() {
    let store = Arc::new(EventStore::new(StoreOptions::new(512).max_steps_per_flow(50)));

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut stored = 0u64;
                for i in 0..PER_WRITER {
                    let flow = format!("w{}-f{}", w, i % 20);
                    if store
                        .append(EventDraft::new(flow, "Step", "svc", i as u64))
                        .is_stored()
                    {
                        stored += 1;
                    }
                }
                stored
            })
        })
        .collect();

    let stored: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let snap = store.snapshot();

    assert_eq!(stored + snap.append_dropped, (WRITERS * PER_WRITER) as u64);
    assert_eq!(snap.total_events_lifetime, stored);
    assert!(store.len() <= store.capacity());
    assert_eq!(store.cursor(), (WRITERS * PER_WRITER) as u64);

    // Quiescent: the resident count matches what point lookups see
    let resident = (0..store.cursor())
        .filter(|seq| store.get(EventId(*seq)).is_some())
        .count();
    assert_eq!(resident, store.len());
    assert_eq!(store.count_range(0, u64::MAX), resident as u64);
}

/// Readers polling during overwrite churn never see more events than slots
#[test]
fn test_len_never_exceeds_capacity_under_churn() {
    const CAPACITY: usize = 8;
    let store = Arc::new(EventStore::new(StoreOptions::new(CAPACITY)));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut polls = 0u64;
            while !done.load(Ordering::Acquire) {
                assert!(store.len() <= CAPACITY, "len {}", store.len());
                let stored = store.snapshot().events_currently_stored;
                assert!(stored <= CAPACITY as u64, "stored {}", stored);
                polls += 1;
            }
            polls
        })
    };

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50_000u64 {
                    store.append(EventDraft::new(format!("w{}-{}", w, i % 3), "Step", "svc", i));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);

    assert!(reader.join().unwrap() > 0);
    assert!(store.len() <= CAPACITY);
}

/// Per-flow sequences are unique and increasing in member order under contention
#[test]
fn test_shared_flows_get_unique_sequences() {
    let store = Arc::new(EventStore::new(
        StoreOptions::new(100_000).max_steps_per_flow(100_000),
    ));

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..1_000u64 {
                    store.append(EventDraft::new(format!("shared-{}", i % 4), "Step", "svc", i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for flow in 0..4 {
        let events = store.flow_events(&format!("shared-{}", flow)).unwrap();
        assert_eq!(events.len(), WRITERS * 250);
        let seqs: Vec<u64> = events.iter().map(|e| e.flow_seq).collect();
        let expected: Vec<u64> = (1..=(WRITERS * 250) as u64).collect();
        assert_eq!(seqs, expected);
    }
}

/// Readers racing writers only ever observe the event they asked for
#[test]
fn test_readers_never_see_foreign_events() {
    let store = Arc::new(EventStore::new(StoreOptions::new(64)));

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..50_000u64 {
                store.append(EventDraft::new(format!("f{}", i % 7), "Step", "svc", i));
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut hits = HashMap::new();
                for _ in 0..20_000 {
                    let cursor = store.cursor();
                    for seq in cursor.saturating_sub(64)..cursor {
                        if let Some(event) = store.get(EventId(seq)) {
                            assert_eq!(event.id, EventId(seq));
                            *hits.entry(event.correlation_id.clone()).or_insert(0u64) += 1;
                        }
                    }
                    if cursor >= 50_000 {
                        break;
                    }
                }
                hits
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(store.len(), 64);
}

/// A lapped writer drops instead of overwriting a newer event
#[test]
fn test_single_slot_ring_keeps_newest() {
    let store = EventStore::new(StoreOptions::new(1));
    let first = store.append(EventDraft::new("a", "Step", "svc", 1));
    let second = store.append(EventDraft::new("b", "Step", "svc", 2));

    assert!(matches!(first, AppendOutcome::Stored { evicted: None, .. }));
    assert!(matches!(
        second,
        AppendOutcome::Stored { evicted: Some(EventId(0)), .. }
    ));
    assert!(store.get(EventId(0)).is_none());
    assert_eq!(store.get(EventId(1)).unwrap().correlation_id, "b");
    assert!(!store.contains_flow("a"));
}
