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
    io::{ErrorKind, Read, Write},
};

use bytes::Bytes;
use snafu::{ensure, ResultExt};
use tessera_common::DEFAULT_BUFFER_CAPACITY;

use crate::{
    charset::Charset,
    chunk::Chunk,
    codec::{Readable, Writable},
    err::{EncodingSnafu, FixedCapacitySnafu, InboundIoSnafu, OutOfRangeSnafu, Result},
    pool::{ChunkManager, ChunkManagerRef},
};

/// A growable byte region over one chunk with two cursors.
///
/// `start` is the next byte to read and `end` is one past the last byte
/// written, `0 <= start <= end <= capacity` always holds. Offsets are
/// relative to the chunk, so slices keep pointing at the bytes of the buffer
/// they were cut from.
pub struct CodecBuffer {
    chunk:    Chunk,
    start:    usize,
    end:      usize,
    capacity: usize,
    // Slices cannot grow or be written past their boundary.
    fixed:    bool,
}

impl CodecBuffer {
    pub fn allocate(manager: &dyn ChunkManager, capacity: usize) -> Result<Self> {
        let chunk = manager.allocate(capacity)?;
        Ok(Self::over(chunk))
    }

    pub fn with_default_capacity(manager: &dyn ChunkManager) -> Result<Self> {
        Self::allocate(manager, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn from_slice(manager: &dyn ChunkManager, src: &[u8]) -> Result<Self> {
        let mut buf = Self::allocate(manager, src.len())?;
        buf.write_slice(src)?;
        Ok(buf)
    }

    /// Wrap inbound bytes: one read of at most `max` bytes from `reader`.
    pub fn read_from<R: Read + ?Sized>(
        manager: &dyn ChunkManager,
        reader: &mut R,
        max: usize,
    ) -> Result<Self> {
        let mut buf = Self::allocate(manager, max)?;
        buf.fill_from(reader, max)?;
        Ok(buf)
    }

    fn over(chunk: Chunk) -> Self {
        let capacity = chunk.capacity();
        Self {
            chunk,
            start: 0,
            end: 0,
            capacity,
            fixed: false,
        }
    }

    pub fn start(&self) -> usize { self.start }

    pub fn end(&self) -> usize { self.end }

    pub fn capacity(&self) -> usize { self.capacity }

    /// Bytes that can be written without growing.
    pub fn space(&self) -> usize { self.capacity - self.end }

    pub fn is_empty(&self) -> bool { self.start == self.end }

    pub fn is_fixed(&self) -> bool { self.fixed }

    /// Other buffers see the same bytes.
    pub fn is_shared(&self) -> bool { self.chunk.ref_count() > 1 }

    pub fn shares_storage_with(&self, other: &CodecBuffer) -> bool {
        self.chunk.same_storage(&other.chunk)
    }

    pub fn manager(&self) -> Option<ChunkManagerRef> { self.chunk.manager() }

    /// Drop everything readable. A growable buffer rewinds to offset 0, on a
    /// fresh chunk when slices or duplicates still view the old one.
    pub fn clear(&mut self) -> Result<()> {
        if self.fixed {
            self.start = self.end;
            return Ok(());
        }
        if self.is_shared() {
            self.chunk.reallocate(self.capacity, 0..0, 0)?;
            self.capacity = self.chunk.capacity();
        }
        self.start = 0;
        self.end = 0;
        Ok(())
    }

    /// Make room for `needed` more bytes after `end`.
    ///
    /// The new capacity is `max(remaining + needed, base * 2)` where `base`
    /// is the current capacity when nothing has been consumed and the live
    /// size otherwise, so a buffer that is drained as it is filled does not
    /// keep doubling a mostly empty region.
    pub fn ensure_space(&mut self, needed: usize) -> Result<()> {
        if self.space() >= needed {
            return Ok(());
        }
        ensure!(
            !self.fixed,
            FixedCapacitySnafu {
                capacity: self.capacity,
                needed,
            }
        );
        let remaining = self.remaining();
        let base = if self.start == 0 { self.capacity } else { remaining };
        let new_size = (remaining + needed).max(base * 2);
        self.chunk.reallocate(new_size, self.start..self.end, 0)?;
        self.start = 0;
        self.end = remaining;
        self.capacity = self.chunk.capacity();
        Ok(())
    }

    /// Copy as much of `src` as fits without growing, returns the count.
    pub fn write_available(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.space());
        if n > 0 {
            let end = self.end;
            self.chunk.write(|b| b[end..end + n].copy_from_slice(&src[..n]));
            self.end += n;
        }
        n
    }

    /// Copy as much readable data into `dst` as there is, returns the count.
    pub fn read_available(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.remaining());
        if n > 0 {
            let start = self.start;
            self.chunk.read(|b| dst[..n].copy_from_slice(&b[start..start + n]));
            self.start += n;
        }
        n
    }

    /// Read `offset` bytes past the read cursor without moving it.
    pub fn get_u8_at(&self, offset: usize) -> Result<u8> {
        self.check_readable("get", offset, 1)?;
        let at = self.start + offset;
        Ok(self.chunk.read(|b| b[at]))
    }

    pub fn get_slice_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_readable("get", offset, dst.len())?;
        let at = self.start + offset;
        self.chunk.read(|b| dst.copy_from_slice(&b[at..at + dst.len()]));
        Ok(())
    }

    /// Overwrite bytes `offset` past the read cursor. Never grows and never
    /// moves `end`.
    pub fn put_slice_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let limit = self.capacity - self.start;
        ensure!(
            fits(offset, src.len(), limit),
            OutOfRangeSnafu {
                op: "put",
                offset,
                len: src.len(),
                limit,
            }
        );
        let at = self.start + offset;
        self.chunk.write(|b| b[at..at + src.len()].copy_from_slice(src));
        Ok(())
    }

    pub fn put_u8_at(&mut self, offset: usize, value: u8) -> Result<()> {
        self.put_slice_at(offset, &[value])
    }

    fn check_readable(&self, op: &'static str, offset: usize, len: usize) -> Result<()> {
        ensure!(
            fits(offset, len, self.remaining()),
            OutOfRangeSnafu {
                op,
                offset,
                len,
                limit: self.remaining(),
            }
        );
        Ok(())
    }

    /// Cut the next `n` readable bytes off into a fixed buffer over the same
    /// storage and advance past them.
    pub fn slice(&mut self, n: usize) -> Result<CodecBuffer> {
        self.check_readable("slice", 0, n)?;
        let chunk = self.chunk.retain()?;
        let sliced = CodecBuffer {
            chunk,
            start: self.start,
            end: self.start + n,
            capacity: self.start + n,
            fixed: true,
        };
        self.start += n;
        Ok(sliced)
    }

    /// Independent cursors over the same storage.
    pub fn duplicate(&self) -> Result<CodecBuffer> {
        Ok(CodecBuffer {
            chunk:    self.chunk.retain()?,
            start:    self.start,
            end:      self.end,
            capacity: self.capacity,
            fixed:    self.fixed,
        })
    }

    /// Move the readable window to offset 0, giving consumed space back to
    /// writes. When other buffers share the chunk the window moves to a
    /// fresh chunk instead, their bytes stay where they are.
    pub fn compact(&mut self) -> Result<()> {
        if self.fixed || self.start == 0 {
            return Ok(());
        }
        let remaining = self.remaining();
        if self.is_shared() {
            self.chunk.reallocate(self.capacity, self.start..self.end, 0)?;
            self.capacity = self.chunk.capacity();
        } else {
            let (start, end) = (self.start, self.end);
            self.chunk.write(|b| b.copy_within(start..end, 0));
        }
        self.start = 0;
        self.end = remaining;
        Ok(())
    }

    /// Put the readable bytes of `header` in front of this buffer's.
    ///
    /// Uses the consumed gap before `start` when it is large enough, then
    /// trailing slack by shifting the payload forward, and reallocates only
    /// when neither fits.
    pub fn add_first(&mut self, header: &CodecBuffer) -> Result<()> {
        let bytes = header.to_vec();
        let n = bytes.len();
        if n == 0 {
            return Ok(());
        }
        ensure!(
            !self.fixed,
            FixedCapacitySnafu {
                capacity: self.capacity,
                needed:   n,
            }
        );
        let remaining = self.remaining();
        let (start, end) = (self.start, self.end);
        if self.is_shared() {
            self.chunk.reallocate(n + remaining, start..end, n)?;
            self.capacity = self.chunk.capacity();
            self.chunk.write(|b| b[..n].copy_from_slice(&bytes));
            self.start = 0;
            self.end = n + remaining;
        } else if start >= n {
            self.chunk.write(|b| b[start - n..start].copy_from_slice(&bytes));
            self.start -= n;
        } else if self.capacity - end >= n - start {
            self.chunk.write(|b| {
                b.copy_within(start..end, n);
                b[..n].copy_from_slice(&bytes);
            });
            self.start = 0;
            self.end = n + remaining;
        } else {
            let new_size = (n + remaining).max(self.capacity * 2);
            self.chunk.reallocate(new_size, start..end, n)?;
            self.capacity = self.chunk.capacity();
            self.chunk.write(|b| b[..n].copy_from_slice(&bytes));
            self.start = 0;
            self.end = n + remaining;
        }
        Ok(())
    }

    /// Append the readable bytes of `footer`.
    pub fn add_last(&mut self, footer: &CodecBuffer) -> Result<()> {
        let bytes = footer.to_vec();
        self.write_slice(&bytes)
    }

    /// First occurrence of `needle` at or after `from`, relative to `start`.
    pub fn index_of(&self, needle: &[u8], from: usize) -> Option<usize> {
        if from > self.remaining() {
            return None;
        }
        self.with_readable(|window| find(&window[from..], needle).map(|i| i + from))
    }

    /// Last occurrence of `needle` starting at or before `from`.
    pub fn last_index_of(&self, needle: &[u8], from: usize) -> Option<usize> {
        self.with_readable(|window| {
            let limit = from.saturating_add(needle.len()).min(window.len());
            rfind(&window[..limit], needle)
        })
    }

    pub fn index_of_byte(&self, byte: u8, from: usize) -> Option<usize> {
        self.index_of(&[byte], from)
    }

    pub fn last_index_of_byte(&self, byte: u8, from: usize) -> Option<usize> {
        self.last_index_of(&[byte], from)
    }

    /// Run `f` over the readable bytes.
    pub fn with_readable<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let (start, end) = (self.start, self.end);
        self.chunk.read(|b| f(&b[start..end]))
    }

    pub fn to_vec(&self) -> Vec<u8> { self.with_readable(|b| b.to_vec()) }

    /// Copy of the readable bytes, the cursors do not move.
    pub fn to_bytes(&self) -> Bytes { Bytes::from(self.to_vec()) }

    /// Append at most `max` bytes from one read of `reader`.
    ///
    /// A reader that would block yields zero bytes rather than an error.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R, max: usize) -> Result<usize> {
        self.ensure_space(max)?;
        let end = self.end;
        loop {
            match self.chunk.write(|b| reader.read(&mut b[end..end + max])) {
                Ok(n) => {
                    self.end += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(e).context(InboundIoSnafu),
            }
        }
    }

    /// One write of the readable bytes into `sink`, consuming what it took.
    pub fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> std::io::Result<usize> {
        let n = self.with_readable(|b| sink.write(b))?;
        self.start += n.min(self.remaining());
        Ok(n)
    }

    /// Give the chunk back now instead of at drop.
    pub fn release(self) -> Result<()> { self.chunk.release() }
}

/// `offset..offset + len` lies within `limit` without overflowing.
pub(crate) fn fits(offset: usize, len: usize, limit: usize) -> bool {
    offset.checked_add(len).is_some_and(|end| end <= limit)
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub(crate) fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

impl Readable for CodecBuffer {
    fn remaining(&self) -> usize { self.end - self.start }

    fn read_u8(&mut self) -> Result<u8> {
        let value = self.get_u8_at(0)?;
        self.start += 1;
        Ok(value)
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check_readable("read", 0, dst.len())?;
        self.read_available(dst);
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.check_readable("skip", 0, n)?;
        self.start += n;
        Ok(())
    }

    fn read_str(&mut self, len: usize, charset: Charset) -> Result<String> {
        self.check_readable("read string", 0, len)?;
        let decoded = self
            .with_readable(|b| charset.decode(&b[..len]))
            .context(EncodingSnafu)?;
        self.start += len;
        Ok(decoded)
    }
}

impl Writable for CodecBuffer {
    fn write_u8(&mut self, value: u8) -> Result<()> { self.write_slice(&[value]) }

    fn write_slice(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_space(src.len())?;
        self.write_available(src);
        Ok(())
    }
}

impl Debug for CodecBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecBuffer")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("capacity", &self.capacity)
            .field("fixed", &self.fixed)
            .field("chunk", &self.chunk)
            .finish()
    }
}
