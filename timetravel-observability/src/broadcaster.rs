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

//! Notification Broadcaster
//!
//! Producers call [`Broadcaster::publish`], which never blocks and never waits
//! on subscribers: updates go into a bounded queue that drops its oldest entry
//! when full. A single worker task drains the queue in batches and hands each
//! batch to every subscriber's outbox. Each subscriber has its own delivery
//! task, so a slow sink only delays itself.
//!
//! ## Architecture
//!
//! ```text
//! publish ──► [bounded queue, drop-oldest] ──► worker ─┬─► outbox A ──► task A ──► sink A (timeout)
//!                                                ▲     ├─► outbox B ──► task B ──► sink B (timeout)
//!                            heartbeat (stats) ──┘     └─► outbox C ──► task C ──► sink C (timeout)
//! ```
//!
//! A batch is dispatched once `max_batch` updates are queued or `flush_interval`
//! has passed since the worker woke up, whichever comes first. Outboxes hold at
//! most `queue_capacity` batches and also drop their oldest entry when full. A
//! subscriber that fails `max_consecutive_failures` deliveries in a row is
//! unregistered; other subscribers are unaffected.

use crate::sink::{SinkError, UpdateSink};
use crate::update::{Update, UpdateBatch, UpdateFilter};
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use timetravel_core::BroadcasterConfig;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

/// Broadcaster counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcasterStats {
    pub published: u64,
    /// Updates discarded because the queue was full
    pub dropped: u64,
    /// Batches discarded because a subscriber's outbox was full
    pub lagged: u64,
    pub delivered_batches: u64,
    pub failed_deliveries: u64,
    /// Subscribers removed after repeated failures
    pub unregistered: u64,
    pub subscribers: usize,
    pub queued: usize,
}

#[derive(Default)]
struct OutboxState {
    batches: VecDeque<UpdateBatch>,
    in_flight: bool,
}

/// Pending batches for one subscriber, drained by its delivery task
struct Outbox {
    state: Mutex<OutboxState>,
    ready: Notify,
    idle: Notify,
    closed: CancellationToken,
    started: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl Outbox {
    fn new(closed: CancellationToken) -> Self {
        Self {
            state: Mutex::new(OutboxState::default()),
            ready: Notify::new(),
            idle: Notify::new(),
            closed,
            started: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Returns false if the oldest batch was dropped to make room.
    fn push(&self, batch: UpdateBatch, capacity: usize) -> bool {
        let kept_all = {
            let mut state = self.state.lock();
            let overflow = state.batches.len() >= capacity;
            if overflow {
                state.batches.pop_front();
            }
            state.batches.push_back(batch);
            !overflow
        };
        self.ready.notify_one();
        kept_all
    }

    fn take(&self) -> Option<UpdateBatch> {
        let mut state = self.state.lock();
        let batch = state.batches.pop_front();
        state.in_flight = batch.is_some();
        batch
    }

    fn finish_delivery(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.in_flight = false;
            state.batches.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        if self.closed.is_cancelled() {
            return true;
        }
        let state = self.state.lock();
        state.batches.is_empty() && !state.in_flight
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => return,
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
        self.state.lock().batches.clear();
        self.idle.notify_waiters();
    }
}

struct Subscriber {
    sink: Arc<dyn UpdateSink>,
    filter: UpdateFilter,
    outbox: Arc<Outbox>,
}

struct Shared {
    config: BroadcasterConfig,
    queue: Mutex<VecDeque<Update>>,
    notify: Notify,
    subscribers: DashMap<SubscriberId, Subscriber>,
    /// Parent of every outbox token; cancelled when the last handle goes away
    closed: CancellationToken,
    next_subscriber: AtomicU64,
    next_batch: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    lagged: AtomicU64,
    delivered_batches: AtomicU64,
    failed_deliveries: AtomicU64,
    unregistered: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Cheaply cloneable handle to a shared broadcaster
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Broadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                subscribers: DashMap::new(),
                closed: CancellationToken::new(),
                next_subscriber: AtomicU64::new(1),
                next_batch: AtomicU64::new(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                lagged: AtomicU64::new(0),
                delivered_batches: AtomicU64::new(0),
                failed_deliveries: AtomicU64::new(0),
                unregistered: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.shared.config
    }

    /// Enqueue an update. Returns false if the oldest queued update was dropped
    /// to make room.
    pub fn publish(&self, update: Update) -> bool {
        let capacity = self.shared.config.queue_capacity.max(1);
        let kept_all = {
            let mut queue = self.shared.queue.lock();
            let overflow = queue.len() >= capacity;
            if overflow {
                queue.pop_front();
            }
            queue.push_back(update);
            !overflow
        };

        if !kept_all {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
        kept_all
    }

    pub fn subscribe(&self, sink: Arc<dyn UpdateSink>) -> SubscriberId {
        self.subscribe_with(sink, UpdateFilter::all())
    }

    /// Register a sink. Its delivery task starts with the first batch, so this
    /// may be called outside a runtime.
    pub fn subscribe_with(&self, sink: Arc<dyn UpdateSink>, filter: UpdateFilter) -> SubscriberId {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, sink = sink.name(), "Subscriber registered");
        let outbox = Arc::new(Outbox::new(self.shared.closed.child_token()));
        self.shared.subscribers.insert(
            id,
            Subscriber {
                sink,
                filter,
                outbox,
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.shared.subscribers.remove(&id) {
            Some((_, sub)) => {
                sub.outbox.close();
                true
            }
            None => false,
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.shared.subscribers.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BroadcasterStats {
        let s = &self.shared;
        BroadcasterStats {
            published: s.published.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            lagged: s.lagged.load(Ordering::Relaxed),
            delivered_batches: s.delivered_batches.load(Ordering::Relaxed),
            failed_deliveries: s.failed_deliveries.load(Ordering::Relaxed),
            unregistered: s.unregistered.load(Ordering::Relaxed),
            subscribers: s.subscribers.len(),
            queued: self.queue_len(),
        }
    }

    /// Start the dispatch worker.
    ///
    /// `heartbeat` is polled every heartbeat interval; its update, if any, is
    /// published and dispatched immediately. Cancelling `shutdown` dispatches
    /// whatever is still queued, waits up to `send_timeout` for outboxes to
    /// drain, and stops the worker.
    pub fn spawn<H>(&self, heartbeat: H, shutdown: CancellationToken) -> JoinHandle<()>
    where
        H: Fn() -> Option<Update> + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move { this.run(heartbeat, shutdown).await })
    }

    async fn run<H>(self, heartbeat: H, shutdown: CancellationToken)
    where
        H: Fn() -> Option<Update> + Send + 'static,
    {
        let config = self.shared.config.clone();
        let period = config.heartbeat();
        let mut heartbeat_tick = interval_at(Instant::now() + period, period);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            queue_capacity = config.queue_capacity,
            max_batch = config.max_batch,
            "Broadcaster worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    let batches = self.flush().await;
                    let drained = self.wait_delivered(config.send_timeout()).await;
                    info!(final_batches = batches, drained, "Broadcaster worker stopped");
                    break;
                }

                _ = heartbeat_tick.tick() => {
                    if let Some(update) = heartbeat() {
                        self.publish(update);
                    }
                    self.flush().await;
                }

                _ = self.shared.notify.notified() => {
                    let deadline = Instant::now() + config.flush_interval();
                    while self.queue_len() < config.max_batch {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            _ = sleep_until(deadline) => break,
                            _ = self.shared.notify.notified() => {}
                        }
                    }
                    self.flush().await;
                }
            }
        }
    }

    /// Drain the queue into subscriber outboxes in batches of up to
    /// `max_batch`. Returns the number of batches. Never waits on a sink; use
    /// [`Broadcaster::wait_delivered`] to wait for delivery. Must be called
    /// within a tokio runtime.
    pub async fn flush(&self) -> usize {
        let max_batch = self.shared.config.max_batch.max(1);
        let mut batches = 0;
        loop {
            let updates: Vec<Update> = {
                let mut queue = self.shared.queue.lock();
                let n = queue.len().min(max_batch);
                queue.drain(..n).collect()
            };
            if updates.is_empty() {
                return batches;
            }
            self.dispatch(updates);
            batches += 1;
        }
    }

    /// Wait until every outbox is empty with nothing in flight, or until
    /// `timeout` passes. Returns false on timeout.
    pub async fn wait_delivered(&self, timeout: Duration) -> bool {
        let outboxes: Vec<Arc<Outbox>> = self
            .shared
            .subscribers
            .iter()
            .map(|entry| Arc::clone(&entry.value().outbox))
            .collect();
        let waits = join_all(outboxes.iter().map(|outbox| outbox.wait_idle()));
        tokio::time::timeout(timeout, waits).await.is_ok()
    }

    fn dispatch(&self, updates: Vec<Update>) {
        let sequence = self.shared.next_batch.fetch_add(1, Ordering::Relaxed);
        let capacity = self.shared.config.queue_capacity.max(1);

        // Collect targets first; no map guard is held while tasks start
        let jobs: Vec<(SubscriberId, Arc<dyn UpdateSink>, Arc<Outbox>, UpdateBatch)> = self
            .shared
            .subscribers
            .iter()
            .filter_map(|entry| {
                let sub = entry.value();
                let batch_updates: Vec<Update> = if sub.filter.is_all() {
                    updates.clone()
                } else {
                    updates
                        .iter()
                        .filter(|u| sub.filter.matches(u))
                        .cloned()
                        .collect()
                };
                if batch_updates.is_empty() {
                    return None;
                }
                Some((
                    *entry.key(),
                    Arc::clone(&sub.sink),
                    Arc::clone(&sub.outbox),
                    UpdateBatch {
                        sequence,
                        updates: batch_updates,
                    },
                ))
            })
            .collect();

        for (id, sink, outbox, batch) in jobs {
            if !outbox.push(batch, capacity) {
                self.shared.lagged.fetch_add(1, Ordering::Relaxed);
                debug!(subscriber = id, "Subscriber lagging; oldest batch dropped");
            }
            if !outbox.started.swap(true, Ordering::AcqRel) {
                let shared = Arc::downgrade(&self.shared);
                tokio::spawn(drive(shared, id, sink, outbox));
            }
        }
    }
}

/// Delivery loop for one subscriber. Exits when the outbox is closed or the
/// broadcaster is gone.
async fn drive(
    shared: Weak<Shared>,
    id: SubscriberId,
    sink: Arc<dyn UpdateSink>,
    outbox: Arc<Outbox>,
) {
    loop {
        let batch = loop {
            if let Some(batch) = outbox.take() {
                break batch;
            }
            tokio::select! {
                biased;
                _ = outbox.closed.cancelled() => return,
                _ = outbox.ready.notified() => {}
            }
        };

        let Some((timeout, max_failures)) = shared.upgrade().map(|s| {
            (
                s.config.send_timeout(),
                s.config.max_consecutive_failures.max(1),
            )
        }) else {
            return;
        };

        let delivery = AssertUnwindSafe(sink.deliver(&batch)).catch_unwind();
        let result = match tokio::time::timeout(timeout, delivery).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SinkError::Panicked),
            Err(_) => Err(SinkError::Timeout(timeout)),
        };

        let Some(shared) = shared.upgrade() else {
            outbox.finish_delivery();
            return;
        };
        match result {
            Ok(()) => {
                shared.delivered_batches.fetch_add(1, Ordering::Relaxed);
                outbox.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(error) => {
                shared.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                let failures = outbox.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(subscriber = id, failures, %error, "Update delivery failed");

                if failures >= max_failures {
                    if shared.subscribers.remove(&id).is_some() {
                        shared.unregistered.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber = id, "Subscriber unregistered after repeated failures");
                    }
                    outbox.close();
                    return;
                }
            }
        }
        outbox.finish_delivery();
    }
}
