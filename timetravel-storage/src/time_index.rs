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

//! Coarse time index for range counts and ordered range scans.
//!
//! Keys are `(timestamp_us, global_seq)`, so ties on timestamp break by
//! capture order. The index is split into [`TIME_SHARDS`] shards by global
//! sequence, each shard a mutex-guarded map of fixed-width time buckets.
//! Writers only lock the shard their event lands in.
//!
//! ```text
//! TimeIndex
//! ├── shard[seq % 16]: Mutex<BTreeMap<bucket, Bucket>>
//! │   └── Bucket { keys: BTreeSet<EventKey>, max_seq }
//! └── ...
//! ```

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use timetravel_core::EventId;

/// Number of independently locked shards
pub const TIME_SHARDS: usize = 16;

/// Position of an event on the time axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub timestamp_us: u64,
    pub id: EventId,
}

impl EventKey {
    pub fn new(timestamp_us: u64, id: EventId) -> Self {
        Self { timestamp_us, id }
    }

    fn lowest(timestamp_us: u64) -> Self {
        Self::new(timestamp_us, EventId(0))
    }

    fn highest(timestamp_us: u64) -> Self {
        Self::new(timestamp_us, EventId(u64::MAX))
    }
}

#[derive(Debug, Default)]
struct Bucket {
    keys: BTreeSet<EventKey>,
    /// Upper bound on member sequences; may be stale-high after removals
    max_seq: u64,
}

type Shard = BTreeMap<u64, Bucket>;

#[derive(Debug)]
pub struct TimeIndex {
    bucket_us: u64,
    shards: Box<[Mutex<Shard>]>,
}

impl TimeIndex {
    pub fn new(bucket_us: u64) -> Self {
        Self {
            bucket_us: bucket_us.max(1),
            shards: (0..TIME_SHARDS).map(|_| Mutex::new(Shard::new())).collect(),
        }
    }

    pub fn bucket_us(&self) -> u64 {
        self.bucket_us
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, id: EventId) -> &Mutex<Shard> {
        &self.shards[(id.0 % TIME_SHARDS as u64) as usize]
    }

    #[inline]
    fn bucket_of(&self, timestamp_us: u64) -> u64 {
        timestamp_us / self.bucket_us
    }

    pub fn insert(&self, key: EventKey) {
        let bucket_no = self.bucket_of(key.timestamp_us);
        let mut shard = self.shard(key.id).lock();
        let bucket = shard.entry(bucket_no).or_default();
        bucket.keys.insert(key);
        bucket.max_seq = bucket.max_seq.max(key.id.0);
    }

    pub fn remove(&self, key: EventKey) -> bool {
        let bucket_no = self.bucket_of(key.timestamp_us);
        let mut shard = self.shard(key.id).lock();
        let Some(bucket) = shard.get_mut(&bucket_no) else {
            return false;
        };
        let removed = bucket.keys.remove(&key);
        if bucket.keys.is_empty() {
            shard.remove(&bucket_no);
        }
        removed
    }

    /// Count keys with `start_us <= timestamp <= end_us` and sequence below `bound`.
    ///
    /// Buckets lying wholly inside the range are counted by size.
    pub fn count(&self, start_us: u64, end_us: u64, bound: u64) -> u64 {
        if start_us > end_us {
            return 0;
        }
        let first = self.bucket_of(start_us);
        let last = self.bucket_of(end_us);
        let (lo, hi) = (EventKey::lowest(start_us), EventKey::highest(end_us));

        let mut total = 0u64;
        for shard in self.shards.iter() {
            let shard = shard.lock();
            for (&bucket_no, bucket) in shard.range(first..=last) {
                let bucket_start = bucket_no.saturating_mul(self.bucket_us);
                let bucket_end = bucket_start.saturating_add(self.bucket_us - 1);
                let inside = bucket_start >= start_us && bucket_end <= end_us;
                if inside && bucket.max_seq < bound {
                    total += bucket.keys.len() as u64;
                } else {
                    total += bucket
                        .keys
                        .range(lo..=hi)
                        .filter(|k| k.id.0 < bound)
                        .count() as u64;
                }
            }
        }
        total
    }

    /// Next keys of one shard in `(timestamp, seq)` order, strictly after `after`
    pub fn page(
        &self,
        shard: usize,
        after: Option<EventKey>,
        start_us: u64,
        end_us: u64,
        bound: u64,
        limit: usize,
    ) -> Vec<EventKey> {
        let mut out = Vec::new();
        if start_us > end_us || limit == 0 || shard >= self.shards.len() {
            return out;
        }
        let hi = EventKey::highest(end_us);
        let lower = match after {
            Some(key) if key >= hi => return out,
            Some(key) if key >= EventKey::lowest(start_us) => Bound::Excluded(key),
            _ => Bound::Included(EventKey::lowest(start_us)),
        };
        let first_ts = match lower {
            Bound::Excluded(key) => key.timestamp_us,
            _ => start_us,
        };

        let guard = self.shards[shard].lock();
        for bucket in guard.range(self.bucket_of(first_ts)..=self.bucket_of(end_us)) {
            for key in bucket.1.keys.range((lower, Bound::Included(hi))) {
                if key.id.0 < bound {
                    out.push(*key);
                    if out.len() == limit {
                        return out;
                    }
                }
            }
        }
        out
    }

    /// Up to `limit` keys with timestamps strictly before `cutoff_us`
    pub fn keys_before(&self, cutoff_us: u64, limit: usize) -> Vec<EventKey> {
        let mut out = Vec::new();
        if cutoff_us == 0 {
            return out;
        }
        let last_ts = cutoff_us - 1;
        for shard in self.shards.iter() {
            let shard = shard.lock();
            for bucket in shard.range(..=self.bucket_of(last_ts)).map(|(_, b)| b) {
                for key in bucket.keys.range(..=EventKey::highest(last_ts)) {
                    if out.len() == limit {
                        return out;
                    }
                    out.push(*key);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().values().map(|b| b.keys.len()).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
