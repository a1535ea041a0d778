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
    fmt::{Debug, Formatter},
    ops::Range,
    sync::{
        atomic::{AtomicIsize, Ordering},
        Arc, Weak,
    },
};

use memmap2::MmapMut;
use parking_lot::RwLock;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::error;

use crate::{
    config::StorageKind,
    err::{
        AlreadyReleasedSnafu, ManagerClosedSnafu, NativeAllocSnafu, OutOfRangeSnafu, Result,
        StateConflictSnafu,
    },
    pool::{ChunkManager, ChunkManagerRef},
};

const UNUSABLE: isize = 0;
const PRE_INITIALIZED: isize = -1;

/// The bytes behind a chunk.
pub(crate) enum Storage {
    Heap(Box<[u8]>),
    Native(MmapMut),
}

impl Storage {
    pub(crate) fn allocate(kind: StorageKind, size: usize) -> Result<Self> {
        match kind {
            StorageKind::Heap => Ok(Storage::Heap(vec![0u8; size].into_boxed_slice())),
            StorageKind::Native => MmapMut::map_anon(size)
                .map(Storage::Native)
                .context(NativeAllocSnafu { size }),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Heap(b) => b,
            Storage::Native(m) => m,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Heap(b) => b,
            Storage::Native(m) => m,
        }
    }

    fn kind(&self) -> StorageKind {
        match self {
            Storage::Heap(_) => StorageKind::Heap,
            Storage::Native(_) => StorageKind::Native,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Unusable,
    PreInitialized,
    Active(usize),
}

impl From<isize> for ChunkState {
    fn from(refs: isize) -> Self {
        match refs {
            PRE_INITIALIZED => ChunkState::PreInitialized,
            n if n > 0 => ChunkState::Active(n as usize),
            _ => ChunkState::Unusable,
        }
    }
}

/// One physical storage block together with its reference count.
///
/// A RawChunk never hands out its bytes directly, callers go through a
/// [Chunk] handle obtained from [RawChunk::initialize] or [Chunk::retain].
/// The count doubles as the lifecycle state: `0` is unusable, `-1` is ready
/// to be handed out, anything positive is the number of live handles.
pub struct RawChunk {
    refs:     AtomicIsize,
    capacity: usize,
    storage:  RwLock<Storage>,
    owner:    Weak<dyn ChunkManager>,
    owner_id: u64,
    pooled:   bool,
}

impl RawChunk {
    pub(crate) fn new(
        storage: Storage,
        owner: Weak<dyn ChunkManager>,
        owner_id: u64,
        pooled: bool,
    ) -> Arc<Self> {
        let capacity = storage.as_slice().len();
        Arc::new(Self {
            refs: AtomicIsize::new(UNUSABLE),
            capacity,
            storage: RwLock::new(storage),
            owner,
            owner_id,
            pooled,
        })
    }

    pub fn state(&self) -> ChunkState { self.refs.load(Ordering::Acquire).into() }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn owner_id(&self) -> u64 { self.owner_id }

    pub fn is_pooled(&self) -> bool { self.pooled }

    pub fn storage_kind(&self) -> StorageKind { self.storage.read().kind() }

    /// Unusable -> PreInitialized.
    pub fn ready(&self) -> Result<()> {
        self.transition(UNUSABLE, PRE_INITIALIZED, "unusable")
    }

    /// PreInitialized -> Active(1), handing out the first handle.
    pub fn initialize(self: &Arc<Self>) -> Result<Chunk> {
        self.transition(PRE_INITIALIZED, 1, "pre-initialized")?;
        Ok(Chunk {
            raw:      self.clone(),
            released: false,
        })
    }

    fn transition(&self, from: isize, to: isize, expected: &'static str) -> Result<()> {
        self.refs
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| StateConflictSnafu { expected, actual }.build())
    }

    fn increment(&self) -> Result<()> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            ensure!(current > 0, AlreadyReleasedSnafu);
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns true when this call dropped the last reference.
    fn decrement(&self) -> Result<bool> {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return StateConflictSnafu {
                    expected: "active",
                    actual:   current,
                }
                .fail();
            }
            match self.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current == 1),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Debug for RawChunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawChunk")
            .field("state", &self.state())
            .field("capacity", &self.capacity)
            .field("owner_id", &self.owner_id)
            .field("pooled", &self.pooled)
            .finish()
    }
}

/// A counted handle onto a [RawChunk].
///
/// Every live handle holds exactly one reference. [Chunk::release] gives it
/// back explicitly, dropping the handle does the same. The handle that
/// brings the count to zero runs the owning manager's reclaim hook once.
pub struct Chunk {
    raw:      Arc<RawChunk>,
    released: bool,
}

impl Chunk {
    pub fn capacity(&self) -> usize { self.raw.capacity }

    pub fn ref_count(&self) -> usize {
        match self.raw.state() {
            ChunkState::Active(n) => n,
            _ => 0,
        }
    }

    pub fn raw(&self) -> &Arc<RawChunk> { &self.raw }

    /// Another handle onto the same bytes.
    pub fn retain(&self) -> Result<Chunk> {
        self.raw.increment()?;
        Ok(Chunk {
            raw:      self.raw.clone(),
            released: false,
        })
    }

    pub fn release(mut self) -> Result<()> { self.release_ref() }

    fn release_ref(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.raw.decrement()? {
            if let Some(manager) = self.raw.owner.upgrade() {
                manager.reclaim(self.raw.clone())?;
            }
        }
        Ok(())
    }

    pub fn same_storage(&self, other: &Chunk) -> bool { Arc::ptr_eq(&self.raw, &other.raw) }

    pub fn manager(&self) -> Option<ChunkManagerRef> { self.raw.owner.upgrade() }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        debug_assert!(matches!(self.raw.state(), ChunkState::Active(_)));
        f(self.raw.storage.read().as_slice())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(matches!(self.raw.state(), ChunkState::Active(_)));
        f(self.raw.storage.write().as_mut_slice())
    }

    /// Swap this handle for a fresh chunk of at least `new_size` bytes from
    /// the same manager, copying `window` to offset `at` of the new storage.
    /// The old chunk is released.
    pub fn reallocate(&mut self, new_size: usize, window: Range<usize>, at: usize) -> Result<()> {
        ensure!(
            window.start <= window.end && window.end <= self.capacity(),
            OutOfRangeSnafu {
                op:     "reallocate",
                offset: window.start,
                len:    window.end.saturating_sub(window.start),
                limit:  self.capacity(),
            }
        );
        let manager = self.manager().context(ManagerClosedSnafu)?;
        let len = window.len();
        let fresh = manager.allocate(new_size.max(at + len))?;
        self.read(|src| fresh.write(|dst| dst[at..at + len].copy_from_slice(&src[window])));
        std::mem::replace(self, fresh).release()
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("raw", &self.raw)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Err(e) = self.release_ref() {
            error!("failed to release chunk {:?}: {}", self.raw, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::UnpooledChunkManager;

    fn detached(size: usize) -> Arc<RawChunk> {
        let owner: Weak<UnpooledChunkManager> = Weak::new();
        RawChunk::new(
            Storage::allocate(StorageKind::Heap, size).unwrap(),
            owner,
            0,
            false,
        )
    }

    #[test]
    fn two_phase_activation() {
        let raw = detached(16);
        assert_eq!(raw.state(), ChunkState::Unusable);

        let err = raw.initialize().unwrap_err();
        assert!(err.is_state_conflict());

        raw.ready().unwrap();
        assert_eq!(raw.state(), ChunkState::PreInitialized);
        assert!(raw.ready().unwrap_err().is_state_conflict());

        let chunk = raw.initialize().unwrap();
        assert_eq!(raw.state(), ChunkState::Active(1));
        drop(chunk);
        assert_eq!(raw.state(), ChunkState::Unusable);
    }

    #[test]
    fn retain_shares_bytes() {
        let raw = detached(32);
        raw.ready().unwrap();
        let a = raw.initialize().unwrap();
        let b = a.retain().unwrap();
        assert_eq!(a.ref_count(), 2);
        assert!(a.same_storage(&b));

        a.write(|bytes| bytes[3] = 42);
        assert_eq!(b.read(|bytes| bytes[3]), 42);

        a.release().unwrap();
        assert_eq!(b.ref_count(), 1);
        b.release().unwrap();
        assert_eq!(raw.state(), ChunkState::Unusable);
    }

    #[test]
    fn retain_after_release_fails() {
        let raw = detached(16);
        raw.ready().unwrap();
        let chunk = raw.initialize().unwrap();
        let stale = Chunk {
            raw:      raw.clone(),
            released: true,
        };
        chunk.release().unwrap();
        let err = stale.retain().unwrap_err();
        assert!(matches!(err, crate::err::Error::AlreadyReleased { .. }));
    }

    #[test]
    fn native_storage() {
        let storage = Storage::allocate(StorageKind::Native, 4096).unwrap();
        assert_eq!(storage.kind(), StorageKind::Native);
        assert_eq!(storage.as_slice().len(), 4096);
    }
}
