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

//! Outbound scheduling for transports built on tessera buffers.

mod config;
pub use config::{
    TransportConfig, WriteQueueConfig, POOL_MAX_SIZE_ENV, POOL_OVERFLOW_ENV, QUEUE_BONUS_ENV,
};
pub mod err;
mod transmit;
pub use transmit::Transmit;
mod write_queue;
pub use write_queue::{FlushStatus, WriteQueue};
