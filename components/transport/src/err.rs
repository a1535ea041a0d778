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

use std::path::PathBuf;

use snafu::{Location, Snafu, Whatever};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("priority {} is out of range, the queue has {} weighted queues", priority, queues))]
    InvalidPriority {
        priority: usize,
        queues:   usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("weight {} of queue {} is outside [{}, {}]", weight, index, min, max))]
    InvalidWeight {
        index:    usize,
        weight:   f32,
        min:      f32,
        max:      f32,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("write to sink failed"))]
    Sink {
        source:   std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    BufferError {
        source: tessera_buffer::err::Error,
    },

    #[snafu(display("malformed transport config"))]
    Config {
        source:   toml::de::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to read config file {}", path.display()))]
    ReadConfig {
        path:     PathBuf,
        source:   std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("bad environment override"))]
    EnvOverride {
        source:   Whatever,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<tessera_buffer::err::Error> for Error {
    fn from(value: tessera_buffer::err::Error) -> Self { Self::BufferError { source: value } }
}

impl Error {
    /// Rejected at the call site because of bad input, not a failed sink.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidPriority { .. }
                | Error::InvalidWeight { .. }
                | Error::Config { .. }
                | Error::EnvOverride { .. }
        )
    }
}
