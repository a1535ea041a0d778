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

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

use snafu::{ensure, OptionExt};
use tessera_common::normalize_chunk_size;
use tracing::{debug, warn};

use super::{next_manager_id, ChunkManager, PoolStats};
use crate::{
    chunk::{Chunk, RawChunk, Storage},
    config::StorageKind,
    err::{ForeignChunkSnafu, ManagerClosedSnafu, OutOfRangeSnafu, OutstandingChunksSnafu, Result},
};

/// Allocates a fresh chunk for every request and frees it on release.
#[derive(Debug)]
pub struct UnpooledChunkManager {
    id:          u64,
    me:          Weak<UnpooledChunkManager>,
    storage:     StorageKind,
    outstanding: AtomicUsize,
    allocations: AtomicU64,
    closed:      AtomicBool,
}

impl UnpooledChunkManager {
    pub fn new(storage: StorageKind) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: next_manager_id(),
            me: me.clone(),
            storage,
            outstanding: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn take(&self, bytes: usize) -> Result<Chunk> {
        let normalized = normalize_chunk_size(bytes).context(OutOfRangeSnafu {
            op:     "allocate",
            offset: 0usize,
            len:    bytes,
            limit:  usize::MAX,
        })?;
        let owner: Weak<dyn ChunkManager> = self.me.clone();
        let raw = RawChunk::new(
            Storage::allocate(self.storage, normalized)?,
            owner,
            self.id,
            false,
        );
        raw.ready()?;
        let chunk = raw.initialize()?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(chunk)
    }
}

impl ChunkManager for UnpooledChunkManager {
    fn id(&self) -> u64 { self.id }

    fn allocate(&self, bytes: usize) -> Result<Chunk> {
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
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
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
            warn!("refusing to close unpooled manager {}: {} chunks outstanding", self.id, count);
            return OutstandingChunksSnafu {
                manager: self.id,
                count,
            }
            .fail();
        }
        debug!("unpooled manager {} closed", self.id);
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            manager_id: self.id,
            outstanding: self.outstanding(),
            unpooled: self.allocations.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_outstanding() {
        let manager = UnpooledChunkManager::new(StorageKind::Heap);
        let a = manager.allocate(100).unwrap();
        assert_eq!(a.capacity(), 128);
        let b = a.retain().unwrap();
        assert_eq!(manager.outstanding(), 1);
        assert!(manager.close().is_err());
        drop(a);
        drop(b);
        assert_eq!(manager.outstanding(), 0);
        manager.close().unwrap();
        assert!(manager.allocate(1).is_err());
    }
}
