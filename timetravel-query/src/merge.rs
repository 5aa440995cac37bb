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

//! Streaming K-way merge over time-index shards.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use timetravel_storage::{EventKey, EventStore};

/// Keys fetched from a shard per page
const SCAN_PAGE: usize = 256;

pub struct KWayMerge<T: Ord, I: Iterator<Item = T>> {
    heap: BinaryHeap<Reverse<HeapEntry<T, I>>>,
}

struct HeapEntry<T: Ord, I: Iterator<Item = T>> {
    current: T,
    iterator: I,
}

impl<T: Ord, I: Iterator<Item = T>> Ord for HeapEntry<T, I> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.current.cmp(&other.current)
    }
}

impl<T: Ord, I: Iterator<Item = T>> PartialOrd for HeapEntry<T, I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord, I: Iterator<Item = T>> PartialEq for HeapEntry<T, I> {
    fn eq(&self, other: &Self) -> bool {
        self.current == other.current
    }
}

impl<T: Ord, I: Iterator<Item = T>> Eq for HeapEntry<T, I> {}

impl<T: Ord, I: Iterator<Item = T>> KWayMerge<T, I> {
    pub fn new(iterators: Vec<I>) -> Self {
        let mut heap = BinaryHeap::with_capacity(iterators.len());

        for mut iter in iterators {
            if let Some(current) = iter.next() {
                heap.push(Reverse(HeapEntry {
                    current,
                    iterator: iter,
                }));
            }
        }

        Self { heap }
    }
}

impl<T: Ord, I: Iterator<Item = T>> Iterator for KWayMerge<T, I> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(mut entry) = self.heap.pop()?;

        match entry.iterator.next() {
            Some(next) => {
                let result = std::mem::replace(&mut entry.current, next);
                self.heap.push(Reverse(entry));
                Some(result)
            }
            None => Some(entry.current),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), None)
    }
}

/// Lazy, paged scan of one time-index shard within a frozen scope
pub struct ShardScan {
    store: Arc<EventStore>,
    shard: usize,
    start_us: u64,
    end_us: u64,
    bound: u64,
    after: Option<EventKey>,
    buffer: VecDeque<EventKey>,
    exhausted: bool,
}

impl ShardScan {
    pub fn new(store: Arc<EventStore>, shard: usize, start_us: u64, end_us: u64, bound: u64) -> Self {
        Self {
            store,
            shard,
            start_us,
            end_us,
            bound,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// One scan per shard, ready to merge
    pub fn all(store: &Arc<EventStore>, start_us: u64, end_us: u64, bound: u64) -> Vec<Self> {
        (0..store.time_index().shard_count())
            .map(|shard| Self::new(Arc::clone(store), shard, start_us, end_us, bound))
            .collect()
    }

    fn refill(&mut self) {
        let page = self.store.time_index().page(
            self.shard,
            self.after,
            self.start_us,
            self.end_us,
            self.bound,
            SCAN_PAGE,
        );
        if page.len() < SCAN_PAGE {
            self.exhausted = true;
        }
        self.after = page.last().copied().or(self.after);
        self.buffer.extend(page);
    }
}

impl Iterator for ShardScan {
    type Item = EventKey;

    fn next(&mut self) -> Option<EventKey> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill();
        }
        self.buffer.pop_front()
    }
}

/// Merged scan of every shard in `(timestamp, global_seq)` order
pub type SystemScan = KWayMerge<EventKey, ShardScan>;

pub fn system_scan(store: &Arc<EventStore>, start_us: u64, end_us: u64, bound: u64) -> SystemScan {
    KWayMerge::new(ShardScan::all(store, start_us, end_us, bound))
}
