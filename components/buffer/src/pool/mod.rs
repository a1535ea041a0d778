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

mod chunk_pool;
mod unpooled;

use std::{
    fmt::{Debug, Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub use chunk_pool::ChunkPool;
use tessera_utils::readable_size::ReadableSize;
pub use unpooled::UnpooledChunkManager;

use crate::{
    chunk::{Chunk, RawChunk},
    config::{PoolConfig, StorageKind},
    err::Result,
};

pub type ChunkManagerRef = Arc<dyn ChunkManager>;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_manager_id() -> u64 { NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed) }

/// Hands out chunks and takes them back.
///
/// Codec buffers are the only callers of [ChunkManager::allocate], and
/// [ChunkManager::reclaim] is only ever reached through the last
/// [Chunk::release] of a chunk.
pub trait ChunkManager: Send + Sync + Debug + 'static {
    fn id(&self) -> u64;

    /// A chunk whose capacity is the smallest power of two >= `bytes`.
    fn allocate(&self, bytes: usize) -> Result<Chunk>;

    /// The release hook, `raw` has just dropped to zero references.
    fn reclaim(&self, raw: Arc<RawChunk>) -> Result<()>;

    /// Chunks handed out and not released yet.
    fn outstanding(&self) -> usize;

    /// Fails when any chunk is still outstanding.
    fn close(&self) -> Result<()>;

    fn stats(&self) -> PoolStats;
}

/// Build the manager described by `config`.
pub fn new_chunk_manager(config: PoolConfig) -> Result<ChunkManagerRef> {
    Ok(ChunkPool::new(config)?)
}

/// A manager that never recycles, with the same outstanding accounting.
pub fn new_unpooled_manager(storage: StorageKind) -> ChunkManagerRef {
    UnpooledChunkManager::new(storage)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub manager_id:   u64,
    pub outstanding:  usize,
    /// Chunks sitting in buckets ready for reuse.
    pub pooled:       usize,
    pub pooled_bytes: usize,
    /// Allocations served from a bucket.
    pub hits:         u64,
    /// Allocations that had to create a poolable chunk.
    pub misses:       u64,
    /// Allocations that bypassed the buckets.
    pub unpooled:     u64,
    /// Released chunks freed because their bucket was full.
    pub dropped:      u64,
}

impl Display for PoolStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ChunkManager {{ id: {}, outstanding: {}, pooled: {} ({}), hits: {}, misses: {}, unpooled: {}, dropped: {} }}",
            self.manager_id,
            self.outstanding,
            self.pooled,
            ReadableSize(self.pooled_bytes as u64),
            self.hits,
            self.misses,
            self.unpooled,
            self.dropped,
        )
    }
}
