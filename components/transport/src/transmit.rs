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

use std::io::{self, Write};

use bytes::{Buf, Bytes};
use tessera_buffer::{CodecBuffer, CompositeBuffer, Readable};

/// An outbound unit the write queue drains into a sink.
///
/// Dropping an item that was never fully sent releases whatever it holds.
pub trait Transmit: Send {
    /// Bytes not sent yet.
    fn pending_bytes(&self) -> usize;

    /// One write attempt, returns how many bytes `sink` took.
    fn transmit(&mut self, sink: &mut dyn Write) -> io::Result<usize>;
}

impl Transmit for CodecBuffer {
    fn pending_bytes(&self) -> usize { Readable::remaining(self) }

    fn transmit(&mut self, sink: &mut dyn Write) -> io::Result<usize> { self.write_to(sink) }
}

impl Transmit for CompositeBuffer {
    fn pending_bytes(&self) -> usize { Readable::remaining(self) }

    fn transmit(&mut self, sink: &mut dyn Write) -> io::Result<usize> { self.write_to(sink) }
}

impl Transmit for Bytes {
    fn pending_bytes(&self) -> usize { self.len() }

    fn transmit(&mut self, sink: &mut dyn Write) -> io::Result<usize> {
        let n = sink.write(&self[..])?;
        self.advance(n.min(self.len()));
        Ok(n)
    }
}

impl<T: Transmit + ?Sized> Transmit for Box<T> {
    fn pending_bytes(&self) -> usize { (**self).pending_bytes() }

    fn transmit(&mut self, sink: &mut dyn Write) -> io::Result<usize> { (**self).transmit(sink) }
}
