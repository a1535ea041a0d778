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

use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    // Lifetime errors, always a bug in the caller.
    #[snafu(display("chunk state conflict: expected {}, found {}", expected, actual))]
    StateConflict {
        expected: &'static str,
        actual:   isize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("chunk already released"))]
    AlreadyReleased {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("chunk owned by manager {} released to manager {}", owner, manager))]
    ForeignChunk {
        owner:    u64,
        manager:  u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("manager {} closed with {} outstanding chunks", manager, count))]
    OutstandingChunks {
        manager:  u64,
        count:    usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("chunk manager is closed"))]
    ManagerClosed {
        #[snafu(implicit)]
        location: Location,
    },

    // Bounds.
    #[snafu(display("{} of {} bytes at {} is out of range, limit {}", op, len, offset, limit))]
    OutOfRange {
        op:       &'static str,
        offset:   usize,
        len:      usize,
        limit:    usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("buffer capacity is fixed at {}, cannot fit {} more bytes", capacity, needed))]
    FixedCapacity {
        capacity: usize,
        needed:   usize,
        #[snafu(implicit)]
        location: Location,
    },

    // Capacity exhaustion.
    #[snafu(display("composite buffer reached its limit of {} segments", limit))]
    SegmentLimit {
        limit:    usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("composite buffer is unusable after a capacity failure"))]
    Poisoned {
        #[snafu(implicit)]
        location: Location,
    },

    // Codec.
    #[snafu(display("string codec failed: {}", source))]
    Encoding {
        source:   crate::charset::CharsetError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("malformed variable byte integer: {}", reason))]
    MalformedVbc {
        reason:   &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("unexpected null where a value is required"))]
    NullValue {
        #[snafu(implicit)]
        location: Location,
    },

    // Allocation.
    #[snafu(display("failed to map {} bytes of native memory", size))]
    NativeAlloc {
        size:     usize,
        source:   std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("inbound read failed"))]
    InboundIo {
        source:   std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid pool config: {}", reason))]
    InvalidPoolConfig {
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            Error::StateConflict { .. } | Error::AlreadyReleased { .. } | Error::ForeignChunk { .. }
        )
    }

    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Error::OutOfRange { .. } | Error::FixedCapacity { .. })
    }

    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Error::SegmentLimit { .. } | Error::Poisoned { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
