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

//! Pooled, reference counted byte storage and the codec buffers built on it.

mod chunk;
pub use chunk::{Chunk, ChunkState, RawChunk};
pub mod charset;
mod codec;
pub use codec::{Readable, Writable};
mod codec_buffer;
pub use codec_buffer::CodecBuffer;
mod composite;
pub use composite::CompositeBuffer;
mod config;
pub use config::{OverflowPolicy, PoolConfig, StorageKind};
pub mod err;
pub mod pool;
pub use pool::{new_chunk_manager, new_unpooled_manager, ChunkManager, ChunkManagerRef, PoolStats};
pub mod vbc;
