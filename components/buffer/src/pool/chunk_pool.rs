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

use std::{
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

use crossbeam_queue::ArrayQueue;
use once_cell::sync::OnceCell;
use snafu::{ensure, OptionExt};
use tessera_common::{bucket_index, normalize_chunk_size, BUCKET_COUNT, MIN_CHUNK_SIZE};
use tessera_utils::readable_size::ReadableSize;
use tracing::{debug, trace, warn};

use super::{next_manager_id, ChunkManager, PoolStats};
use crate::{
    chunk::{Chunk, ChunkState, RawChunk, Storage},
    config::{OverflowPolicy, PoolConfig},
    err::{
        ForeignChunkSnafu, ManagerClosedSnafu, OutOfRangeSnafu, OutstandingChunksSnafu, Result,
        StateConflictSnafu,
    },
};

type Bucket = ArrayQueue<Arc<RawChunk>>;

/// ChunkPool recycles chunks in power-of-two size buckets.
///
/// Every bucket is a bounded lock-free queue created on first use, so the
/// allocation path never takes a lock. A chunk released into a full bucket
/// is simply freed.
pub struct ChunkPool {
    id:              u64,
    me:              Weak<ChunkPool>,
    config:          PoolConfig,
    max_pooled_size: usize,
    buckets:         Box<[OnceCell<Bucket>]>,
    outstanding:     AtomicUsize,
    closed:          AtomicBool,

    hits:     AtomicU64,
    misses:   AtomicU64,
    unpooled: AtomicU64,
    dropped:  AtomicU64,
}

impl ChunkPool {
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let start_at = Instant::now();
        let max_pooled_size = normalize_chunk_size(config.max_pooled_size.as_bytes_usize())
            .context(OutOfRangeSnafu {
                op:     "normalize",
                offset: 0usize,
                len:    config.max_pooled_size.as_bytes_usize(),
                limit:  usize::MAX,
            })?;

        let pool = Arc::new_cyclic(|me| Self {
            id: next_manager_id(),
            me: me.clone(),
            config,
            max_pooled_size,
            buckets: (0..BUCKET_COUNT).map(|_| OnceCell::new()).collect(),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            unpooled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        pool.preallocate()?;

        debug!(
            "{} initialize finished, cost: {:?}",
            &pool,
            start_at.elapsed()
        );
        Ok(pool)
    }

    fn preallocate(&self) -> Result<()> {
        if self.config.preallocate == 0 {
            return Ok(());
        }
        let mut size = MIN_CHUNK_SIZE;
        while size <= self.max_pooled_size {
            let bucket = self.bucket(bucket_index(size));
            for _ in 0..self.config.preallocate {
                // Validation keeps preallocate below the bucket capacity.
                let _ = bucket.push(self.fresh(size, true)?);
            }
            size <<= 1;
        }
        Ok(())
    }

    fn bucket(&self, idx: usize) -> &Bucket {
        self.buckets[idx].get_or_init(|| ArrayQueue::new(self.config.bucket_capacity))
    }

    fn poolable(&self, normalized: usize) -> bool {
        match self.config.overflow {
            OverflowPolicy::Aggressive => true,
            OverflowPolicy::Strict => normalized <= self.max_pooled_size,
        }
    }

    /// A brand new chunk, already moved to PreInitialized.
    fn fresh(&self, normalized: usize, pooled: bool) -> Result<Arc<RawChunk>> {
        let storage = Storage::allocate(self.config.storage, normalized)?;
        let owner: Weak<dyn ChunkManager> = self.me.clone();
        let raw = RawChunk::new(storage, owner, self.id, pooled);
        raw.ready()?;
        Ok(raw)
    }

    pub fn config(&self) -> &PoolConfig { &self.config }

    pub fn pooled_count(&self) -> usize {
        self.buckets
            .iter()
            .filter_map(|b| b.get())
            .map(|b| b.len())
            .sum()
    }

    fn pooled_bytes(&self) -> usize {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(idx, b)| b.get().map(|b| b.len() << idx))
            .sum()
    }

    fn take(&self, bytes: usize) -> Result<Chunk> {
        let normalized = normalize_chunk_size(bytes).context(OutOfRangeSnafu {
            op:     "allocate",
            offset: 0usize,
            len:    bytes,
            limit:  usize::MAX,
        })?;

        let raw = if self.poolable(normalized) {
            match self.bucket(bucket_index(normalized)).pop() {
                Some(raw) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    raw
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.fresh(normalized, true)?
                }
            }
        } else {
            self.unpooled.fetch_add(1, Ordering::Relaxed);
            trace!(
                "{} exceeds the pooled limit {}, allocating unpooled",
                ReadableSize(normalized as u64),
                ReadableSize(self.max_pooled_size as u64)
            );
            self.fresh(normalized, false)?
        };
        raw.initialize()
    }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }
}

impl ChunkManager for ChunkPool {
    fn id(&self) -> u64 { self.id }

    fn allocate(&self, bytes: usize) -> Result<Chunk> {
        // Reserve before reading `closed`. `close` sets the flag before it
        // reads the count.
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let chunk = if self.closed.load(Ordering::SeqCst) {
            ManagerClosedSnafu.fail()
        } else {
            self.take(bytes)
        };
        if chunk.is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
        chunk
    }

    fn reclaim(&self, raw: Arc<RawChunk>) -> Result<()> {
        ensure!(
            raw.owner_id() == self.id,
            ForeignChunkSnafu {
                owner:   raw.owner_id(),
                manager: self.id,
            }
        );
        if raw.state() != ChunkState::Unusable {
            return StateConflictSnafu {
                expected: "unusable",
                actual:   match raw.state() {
                    ChunkState::PreInitialized => -1,
                    ChunkState::Active(n) => n as isize,
                    ChunkState::Unusable => 0,
                },
            }
            .fail();
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if !raw.is_pooled() || self.is_closed() {
            return Ok(());
        }
        raw.ready()?;
        let idx = bucket_index(raw.capacity());
        if let Err(raw) = self.bucket(idx).push(raw) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("bucket {} is full, freeing {:?}", idx, raw);
        }
        Ok(())
    }

    fn outstanding(&self) -> usize { self.outstanding.load(Ordering::Acquire) }

    fn close(&self) -> Result<()> {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        let count = self.outstanding.load(Ordering::SeqCst);
        if count != 0 {
            if !was_closed {
                self.closed.store(false, Ordering::SeqCst);
            }
            warn!("refusing to close {}: {} chunks outstanding", self, count);
            return OutstandingChunksSnafu {
                manager: self.id,
                count,
            }
            .fail();
        }
        if was_closed {
            return Ok(());
        }
        for bucket in self.buckets.iter().filter_map(|b| b.get()) {
            while bucket.pop().is_some() {}
        }
        debug!("chunk pool {} closed", self.id);
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            manager_id:   self.id,
            outstanding:  self.outstanding(),
            pooled:       self.pooled_count(),
            pooled_bytes: self.pooled_bytes(),
            hits:         self.hits.load(Ordering::Relaxed),
            misses:       self.misses.load(Ordering::Relaxed),
            unpooled:     self.unpooled.load(Ordering::Relaxed),
            dropped:      self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self) }
}

impl Display for ChunkPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ChunkPool {{ id: {}, max_pooled_size: {}, overflow: {:?}, storage: {:?}, outstanding: {}, pooled: {} }}",
            self.id,
            ReadableSize(self.max_pooled_size as u64),
            self.config.overflow,
            self.config.storage,
            self.outstanding(),
            self.pooled_count(),
        )
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        let count = self.outstanding();
        if count != 0 {
            warn!("chunk pool {} dropped with {} chunks outstanding", self.id, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rstest::rstest;
    use tessera_utils::logger::install_fmt_log;

    use super::*;
    use crate::{
        config::StorageKind,
        pool::{ChunkManagerRef, UnpooledChunkManager},
    };

    fn pool(max: usize) -> Arc<ChunkPool> {
        ChunkPool::new(PoolConfig::default().with_max_pooled_size(max)).unwrap()
    }

    #[rstest]
    #[case(1, 16)]
    #[case(16, 16)]
    #[case(17, 32)]
    #[case(1000, 1024)]
    #[case(4096, 4096)]
    #[case(4097, 8192)]
    fn capacity_is_next_power_of_two(#[case] request: usize, #[case] expected: usize) {
        let pool = pool(4096);
        let chunk = pool.allocate(request).unwrap();
        assert_eq!(chunk.capacity(), expected);
        chunk.release().unwrap();
        pool.close().unwrap();
    }

    #[test]
    fn recycles_released_chunks() {
        install_fmt_log();
        let pool = pool(4096);
        let a = pool.allocate(100).unwrap();
        let first = Arc::as_ptr(a.raw());
        a.release().unwrap();
        assert_eq!(pool.pooled_count(), 1);

        let b = pool.allocate(120).unwrap();
        assert_eq!(Arc::as_ptr(b.raw()), first);
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        drop(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn close_requires_everything_released() {
        let pool = pool(4096);
        let a = pool.allocate(10).unwrap();
        let b = a.retain().unwrap();
        let c = pool.allocate(5000).unwrap();
        assert_eq!(pool.outstanding(), 2);

        let err = pool.close().unwrap_err();
        assert!(matches!(err, crate::err::Error::OutstandingChunks { count: 2, .. }));
        assert!(!pool.is_closed());
        pool.allocate(10).unwrap().release().unwrap();

        a.release().unwrap();
        b.release().unwrap();
        c.release().unwrap();
        assert_eq!(pool.outstanding(), 0);
        pool.close().unwrap();
        assert!(pool.allocate(10).is_err());
    }

    #[rstest]
    #[case::pooled(true)]
    #[case::unpooled(false)]
    fn nothing_is_handed_out_after_close(#[case] pooled: bool) {
        let manager: ChunkManagerRef = if pooled {
            pool(4096)
        } else {
            UnpooledChunkManager::new(StorageKind::Heap)
        };
        let closed = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let closed = closed.clone();
                thread::spawn(move || loop {
                    match manager.allocate(64) {
                        Ok(chunk) => {
                            assert!(!closed.load(Ordering::SeqCst), "chunk handed out after close");
                            chunk.release().unwrap();
                        }
                        Err(e) => {
                            assert!(matches!(e, crate::err::Error::ManagerClosed { .. }));
                            return;
                        }
                    }
                })
            })
            .collect();

        while manager.close().is_err() {
            thread::yield_now();
        }
        closed.store(true, Ordering::SeqCst);
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(manager.outstanding(), 0);
        assert!(manager.allocate(64).is_err());
    }

    #[test]
    fn strict_overflow_is_not_pooled() {
        let pool = pool(1024);
        let big = pool.allocate(2048).unwrap();
        assert!(!big.raw().is_pooled());
        big.release().unwrap();
        assert_eq!(pool.pooled_count(), 0);
        assert_eq!(pool.stats().unpooled, 1);
    }

    #[test]
    fn aggressive_overflow_is_pooled() {
        let pool = ChunkPool::new(
            PoolConfig::default()
                .with_max_pooled_size(1024)
                .with_overflow(OverflowPolicy::Aggressive),
        )
        .unwrap();
        let big = pool.allocate(2048).unwrap();
        assert!(big.raw().is_pooled());
        big.release().unwrap();
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn full_bucket_frees_the_chunk() {
        let pool = ChunkPool::new(
            PoolConfig::default()
                .with_max_pooled_size(1024)
                .with_bucket_capacity(1),
        )
        .unwrap();
        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(64).unwrap();
        a.release().unwrap();
        b.release().unwrap();
        assert_eq!(pool.pooled_count(), 1);
        assert_eq!(pool.stats().dropped, 1);
    }

    #[test]
    fn foreign_chunk_is_rejected() {
        let home = pool(1024);
        let other = pool(1024);
        let chunk = home.allocate(64).unwrap();
        let raw = chunk.raw().clone();
        chunk.release().unwrap();
        let err = other.reclaim(raw).unwrap_err();
        assert!(matches!(err, crate::err::Error::ForeignChunk { .. }));
        assert_eq!(other.outstanding(), 0);
    }

    #[test]
    fn preallocate_fills_buckets() {
        let pool = ChunkPool::new(
            PoolConfig::default()
                .with_max_pooled_size(64)
                .with_preallocate(2),
        )
        .unwrap();
        // 16, 32 and 64 byte buckets.
        assert_eq!(pool.pooled_count(), 6);
        let chunk = pool.allocate(30).unwrap();
        assert_eq!(pool.stats().hits, 1);
        drop(chunk);
    }

    #[test]
    fn native_storage_pool() {
        let pool = ChunkPool::new(PoolConfig::default().with_storage(StorageKind::Native)).unwrap();
        let chunk = pool.allocate(4096).unwrap();
        assert_eq!(chunk.raw().storage_kind(), StorageKind::Native);
        chunk.write(|b| b[4095] = 7);
        assert_eq!(chunk.read(|b| b[4095]), 7);
    }

    #[test]
    fn concurrent_allocate_release() {
        install_fmt_log();
        let pool = pool(1 << 16);
        let handles = (0..8)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        let chunk = pool.allocate(((t * 131 + i * 17) % 4000) + 1).unwrap();
                        let copy = chunk.retain().unwrap();
                        chunk.write(|b| b[0] = t as u8);
                        assert_eq!(copy.read(|b| b[0]), t as u8);
                        chunk.release().unwrap();
                        copy.release().unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
        debug!("{}", pool.stats());
        pool.close().unwrap();
    }
}
