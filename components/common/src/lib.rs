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

pub const TESSERA: &str = "tessera";

/// Environment variable prefix for every override read by the config layer.
pub const ENV_PREFIX: &str = "TESSERA_";

// ========Chunk pool ===>
/// The biggest chunk the pool keeps for reuse by default.
pub const DEFAULT_MAX_POOLED_SIZE: usize = 4 << 20; // 4 MiB
/// How many released chunks a single size bucket retains.
pub const DEFAULT_BUCKET_CAPACITY: usize = 1024;
/// One bucket per bit of `usize`, bucket `i` holds chunks of `1 << i` bytes.
pub const BUCKET_COUNT: usize = usize::BITS as usize;
/// The smallest chunk handed out, tiny requests are rounded up to it.
pub const MIN_CHUNK_SIZE: usize = 16;

// ========Codec buffers ===>
/// Capacity of a buffer allocated without an explicit size hint.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;
/// A composite buffer refuses to grow past this many segments.
pub const MAX_COMPOSITE_SEGMENTS: usize = 1024;

// ========Write queue ===>
/// Integer weight of the base queue, float weights are scaled against it.
pub const BASE_WEIGHT: u32 = 100;
pub const MIN_QUEUE_WEIGHT: f32 = 0.05;
pub const MAX_QUEUE_WEIGHT: f32 = 1.0;
/// Quantum granted to weighted queues in a round where the base queue had
/// nothing to send.
pub const DEFAULT_BASE_QUANTUM_BONUS: usize = 64 << 10; // 64 KiB

/// Round `size` up to the next power of two, never below [MIN_CHUNK_SIZE].
/// `None` when no power of two that big fits in a `usize`.
pub fn normalize_chunk_size(size: usize) -> Option<usize> {
    size.max(MIN_CHUNK_SIZE).checked_next_power_of_two()
}

/// Bucket index of a normalized chunk size.
pub fn bucket_index(normalized: usize) -> usize {
    debug_assert!(normalized.is_power_of_two());
    normalized.trailing_zeros() as usize
}

pub type ChunkSize = usize;
pub type BucketIndex = usize;
pub type Priority = usize;
