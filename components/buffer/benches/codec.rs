// Copyright 2024 tessera
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_buffer::{
    new_chunk_manager, vbc, ChunkManagerRef, CodecBuffer, CompositeBuffer, PoolConfig, Readable,
    Writable,
};

fn vbc_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("vbc");
    for value in [0i64, -229, 1 << 20, i64::MIN] {
        group.bench_with_input(BenchmarkId::new("encode", value), &value, |b, &v| {
            b.iter(|| vbc::encode_i64(black_box(v)))
        });
        let encoded = vbc::encode_i64(value);
        group.bench_with_input(BenchmarkId::new("decode", value), &encoded, |b, e| {
            b.iter(|| vbc::decode_i64_from_slice(black_box(e)).unwrap())
        });
    }
    group.finish();
}

fn typed_writes(c: &mut Criterion) {
    let manager: ChunkManagerRef = new_chunk_manager(PoolConfig::default()).unwrap();
    let count = 4096u64;
    let mut group = c.benchmark_group("typed-round-trip");
    group.throughput(Throughput::Bytes(count * 12));

    group.bench_function("linear", |b| {
        b.iter(|| {
            let mut buf = CodecBuffer::allocate(&*manager, 64).unwrap();
            for i in 0..count {
                buf.write_i64(i as i64).unwrap();
                buf.write_i32(i as i32).unwrap();
            }
            for _ in 0..count {
                black_box(buf.read_i64().unwrap());
                black_box(buf.read_i32().unwrap());
            }
        })
    });

    group.bench_function("composite", |b| {
        b.iter(|| {
            let mut buf = CompositeBuffer::new(manager.clone(), 64).unwrap();
            for i in 0..count {
                buf.write_i64(i as i64).unwrap();
                buf.write_i32(i as i32).unwrap();
            }
            for _ in 0..count {
                black_box(buf.read_i64().unwrap());
                black_box(buf.read_i32().unwrap());
            }
        })
    });
    group.finish();
}

fn pool_allocate(c: &mut Criterion) {
    let manager = new_chunk_manager(PoolConfig::default()).unwrap();
    let mut group = c.benchmark_group("pool");
    for size in [64usize, 4096, 1 << 20] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| manager.allocate(black_box(size)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, vbc_codec, typed_writes, pool_allocate);
criterion_main!(benches);
