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

use serde::{Deserialize, Serialize};
use tessera_common::{DEFAULT_BUCKET_CAPACITY, DEFAULT_MAX_POOLED_SIZE};
use tessera_utils::readable_size::ReadableSize;

use crate::err::{InvalidPoolConfigSnafu, Result};

/// What happens to requests bigger than [PoolConfig::max_pooled_size].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Oversized chunks are pooled like any other.
    Aggressive,
    /// Oversized chunks bypass the buckets and are freed on release.
    #[default]
    Strict,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Ok(Self::Aggressive),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown overflow policy {:?}", other)),
        }
    }
}

/// Where chunk bytes live.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A boxed byte slice on the heap.
    #[default]
    Heap,
    /// An anonymous memory mapping outside the allocator.
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// The biggest chunk size that is recycled under [OverflowPolicy::Strict].
    pub max_pooled_size: ReadableSize,
    /// How many released chunks a single size bucket keeps, the rest are
    /// freed.
    pub bucket_capacity: usize,
    /// Chunks allocated up front into every bucket up to `max_pooled_size`.
    pub preallocate:     usize,
    pub overflow:        OverflowPolicy,
    pub storage:         StorageKind,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pooled_size: ReadableSize(DEFAULT_MAX_POOLED_SIZE as u64),
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            preallocate:     0,
            overflow:        OverflowPolicy::default(),
            storage:         StorageKind::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_pooled_size(mut self, size: usize) -> Self {
        self.max_pooled_size = ReadableSize(size as u64);
        self
    }

    pub fn with_bucket_capacity(mut self, capacity: usize) -> Self {
        self.bucket_capacity = capacity;
        self
    }

    pub fn with_preallocate(mut self, count: usize) -> Self {
        self.preallocate = count;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let max = self.max_pooled_size.as_bytes_usize();
        if max == 0 {
            return InvalidPoolConfigSnafu {
                reason: "max_pooled_size must be positive",
            }
            .fail();
        }
        if self.bucket_capacity == 0 {
            return InvalidPoolConfigSnafu {
                reason: "bucket_capacity must be positive",
            }
            .fail();
        }
        if self.preallocate > self.bucket_capacity {
            return InvalidPoolConfigSnafu {
                reason: format!(
                    "cannot preallocate {} chunks into buckets holding {}",
                    self.preallocate, self.bucket_capacity
                ),
            }
            .fail();
        }
        Ok(())
    }
}
