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

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use timetravel_core::{EventDraft, EventId};
use timetravel_storage::{EventStore, StoreOptions};

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for flows in [1usize, 100, 10_000].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(flows), flows, |b, &flows| {
            let store = EventStore::new(StoreOptions::new(10_000));
            let ids: Vec<String> = (0..flows).map(|i| format!("flow-{}", i)).collect();
            let mut i = 0u64;
            b.iter(|| {
                let flow = &ids[(i as usize) % flows];
                i += 1;
                black_box(store.append(EventDraft::new(flow.as_str(), "Step", "svc", i)));
            });
        });
    }

    group.finish();
}

fn bench_point_lookup(c: &mut Criterion) {
    let store = EventStore::new(StoreOptions::new(10_000));
    for i in 0..10_000u64 {
        store.append(EventDraft::new(format!("flow-{}", i % 500), "Step", "svc", i));
    }

    c.bench_function("point_lookup", |b| {
        b.iter(|| {
            black_box(store.get(EventId(black_box(5_000))));
        });
    });
}

fn bench_range_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_count");

    let store = EventStore::new(StoreOptions::new(100_000));
    for i in 0..100_000u64 {
        store.append(EventDraft::new(format!("flow-{}", i % 1_000), "Step", "svc", i * 100));
    }

    for span_secs in [1u64, 60, 600].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(span_secs),
            span_secs,
            |b, &span_secs| {
                b.iter(|| black_box(store.count_range(500_000, 500_000 + span_secs * 1_000_000)));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_point_lookup, bench_range_count);
criterion_main!(benches);
