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
    io::Write,
};

use bytes::{Bytes, BytesMut};
use snafu::{ensure, OptionExt, ResultExt};
use tessera_common::{DEFAULT_BUFFER_CAPACITY, MAX_COMPOSITE_SEGMENTS};
use tracing::warn;

use crate::{
    charset::{Charset, Decoder},
    codec::{Readable, Writable},
    codec_buffer::{fits, CodecBuffer},
    err::{
        EncodingSnafu, FixedCapacitySnafu, OutOfRangeSnafu, PoisonedSnafu, Result,
        SegmentLimitSnafu,
    },
    pool::ChunkManagerRef,
};

/// One logical stream over a bounded list of [CodecBuffer] segments.
///
/// Reads come from the first segment at or after `read_index` that still
/// has data, writes go to `write_index` and spill into a new segment sized
/// `max(2 * previous capacity, still needed)` when it fills up. Hitting
/// [MAX_COMPOSITE_SEGMENTS] poisons the buffer.
pub struct CompositeBuffer {
    manager:     ChunkManagerRef,
    segments:    Vec<CodecBuffer>,
    read_index:  usize,
    write_index: usize,
    fixed:       bool,
    poisoned:    bool,
}

impl CompositeBuffer {
    pub fn new(manager: ChunkManagerRef, initial_capacity: usize) -> Result<Self> {
        let first = CodecBuffer::allocate(&*manager, initial_capacity)?;
        Ok(Self::from_parts(manager, vec![first], false))
    }

    pub fn with_default_capacity(manager: ChunkManagerRef) -> Result<Self> {
        Self::new(manager, DEFAULT_BUFFER_CAPACITY)
    }

    /// Adopt existing buffers as segments, in order.
    pub fn from_segments(manager: ChunkManagerRef, segments: Vec<CodecBuffer>) -> Result<Self> {
        ensure!(
            segments.len() <= MAX_COMPOSITE_SEGMENTS,
            SegmentLimitSnafu {
                limit: MAX_COMPOSITE_SEGMENTS,
            }
        );
        if segments.is_empty() {
            return Self::with_default_capacity(manager);
        }
        Ok(Self::from_parts(manager, segments, false))
    }

    fn from_parts(manager: ChunkManagerRef, segments: Vec<CodecBuffer>, fixed: bool) -> Self {
        debug_assert!(!segments.is_empty());
        let write_index = segments.len() - 1;
        Self {
            manager,
            segments,
            read_index: 0,
            write_index,
            fixed,
            poisoned: false,
        }
    }

    pub fn segment_count(&self) -> usize { self.segments.len() }

    pub fn segments(&self) -> &[CodecBuffer] { &self.segments }

    pub fn is_fixed(&self) -> bool { self.fixed }

    pub fn is_poisoned(&self) -> bool { self.poisoned }

    pub fn capacity(&self) -> usize { self.segments.iter().map(CodecBuffer::capacity).sum() }

    /// Room left in the write segment and the ones after it.
    pub fn space(&self) -> usize {
        self.segments[self.write_index..]
            .iter()
            .map(CodecBuffer::space)
            .sum()
    }

    pub fn is_empty(&self) -> bool { self.remaining() == 0 }

    fn check_usable(&self) -> Result<()> {
        ensure!(!self.poisoned, PoisonedSnafu);
        Ok(())
    }

    fn check_readable(&self, op: &'static str, offset: usize, len: usize) -> Result<()> {
        self.check_usable()?;
        let remaining = self.remaining();
        ensure!(
            fits(offset, len, remaining),
            OutOfRangeSnafu {
                op,
                offset,
                len,
                limit: remaining,
            }
        );
        Ok(())
    }

    fn grow(&mut self, needed: usize) -> Result<()> {
        if self.segments.len() >= MAX_COMPOSITE_SEGMENTS {
            self.poisoned = true;
            warn!(
                "composite buffer hit {} segments, {} bytes did not fit",
                MAX_COMPOSITE_SEGMENTS, needed
            );
            return SegmentLimitSnafu {
                limit: MAX_COMPOSITE_SEGMENTS,
            }
            .fail();
        }
        let previous = self.segments[self.segments.len() - 1].capacity();
        let segment = CodecBuffer::allocate(&*self.manager, (previous * 2).max(needed))?;
        self.segments.push(segment);
        Ok(())
    }

    /// Append `segment` as readable data, later writes land after it.
    pub fn push_segment(&mut self, segment: CodecBuffer) -> Result<()> {
        self.check_usable()?;
        ensure!(
            !self.fixed,
            FixedCapacitySnafu {
                capacity: self.capacity(),
                needed:   segment.remaining(),
            }
        );
        ensure!(
            self.segments.len() < MAX_COMPOSITE_SEGMENTS,
            SegmentLimitSnafu {
                limit: MAX_COMPOSITE_SEGMENTS,
            }
        );
        self.segments.push(segment);
        self.write_index = self.segments.len() - 1;
        Ok(())
    }

    // Step past drained segments, never beyond the last one.
    fn settle_read(&mut self) {
        while self.read_index + 1 < self.segments.len()
            && self.segments[self.read_index].remaining() == 0
        {
            self.read_index += 1;
        }
    }

    fn readable(&self) -> &[CodecBuffer] { &self.segments[self.read_index..] }

    /// The segment holding logical `offset` and the offset inside it.
    fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        let mut base = 0;
        for (i, segment) in self.readable().iter().enumerate() {
            let len = segment.remaining();
            if offset < base + len {
                return Some((self.read_index + i, offset - base));
            }
            base += len;
        }
        None
    }

    pub fn get_u8_at(&self, offset: usize) -> Result<u8> {
        self.check_readable("get", offset, 1)?;
        let (segment, local) = self
            .locate(offset)
            .context(OutOfRangeSnafu {
                op: "get",
                offset,
                len: 1usize,
                limit: self.remaining(),
            })?;
        self.segments[segment].get_u8_at(local)
    }

    pub fn get_slice_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_readable("get", offset, dst.len())?;
        let mut filled = 0;
        while filled < dst.len() {
            let (segment, local) = self.locate(offset + filled).context(OutOfRangeSnafu {
                op: "get",
                offset,
                len: dst.len(),
                limit: self.remaining(),
            })?;
            let segment = &self.segments[segment];
            let take = (segment.remaining() - local).min(dst.len() - filled);
            segment.get_slice_at(local, &mut dst[filled..filled + take])?;
            filled += take;
        }
        Ok(())
    }

    /// Cut the next `n` readable bytes into a fixed composite of slices and
    /// advance past them.
    pub fn slice(&mut self, n: usize) -> Result<CompositeBuffer> {
        self.check_readable("slice", 0, n)?;
        let mut parts = Vec::new();
        let mut left = n;
        loop {
            self.settle_read();
            let segment = &mut self.segments[self.read_index];
            let take = left.min(segment.remaining());
            parts.push(segment.slice(take)?);
            left -= take;
            if left == 0 {
                break;
            }
        }
        Ok(Self::from_parts(self.manager.clone(), parts, true))
    }

    /// Independent cursors over every segment's storage.
    pub fn duplicate(&self) -> Result<CompositeBuffer> {
        let segments = self
            .segments
            .iter()
            .map(CodecBuffer::duplicate)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            manager: self.manager.clone(),
            segments,
            read_index: self.read_index,
            write_index: self.write_index,
            fixed: self.fixed,
            poisoned: self.poisoned,
        })
    }

    /// Release drained leading segments and compact the first live one.
    pub fn compact(&mut self) -> Result<()> {
        self.check_usable()?;
        self.settle_read();
        let drained = self.read_index.min(self.write_index);
        for segment in self.segments.drain(..drained) {
            segment.release()?;
        }
        self.read_index -= drained;
        self.write_index -= drained;
        self.segments[self.read_index].compact()
    }

    pub fn index_of(&self, needle: &[u8], from: usize) -> Option<usize> {
        let total = self.remaining();
        if from > total {
            return None;
        }
        if needle.is_empty() {
            return Some(from);
        }
        let mut base = 0;
        for segment in self.readable() {
            let end = base + segment.remaining();
            if end > from {
                let local_from = from.saturating_sub(base);
                if let Some(i) = segment.index_of(needle, local_from) {
                    return Some(base + i);
                }
                // Matches that begin here and finish in a later segment.
                let first = from.max(base).max(end.saturating_sub(needle.len() - 1));
                for p in first..end {
                    if p + needle.len() <= total && self.matches_at(p, needle) {
                        return Some(p);
                    }
                }
            }
            base = end;
        }
        None
    }

    /// Last occurrence of `needle` starting at or before `from`.
    pub fn last_index_of(&self, needle: &[u8], from: usize) -> Option<usize> {
        let total = self.remaining();
        if needle.len() > total {
            return None;
        }
        let from = from.min(total - needle.len());
        if needle.is_empty() {
            return Some(from);
        }
        let mut end = total;
        for segment in self.readable().iter().rev() {
            let base = end - segment.remaining();
            if base <= from {
                let last = from.min(end.saturating_sub(1));
                let first = base.max(end.saturating_sub(needle.len() - 1));
                for p in (first..=last).rev() {
                    if p + needle.len() > end && self.matches_at(p, needle) {
                        return Some(p);
                    }
                }
                if let Some(i) = segment.last_index_of(needle, from - base) {
                    return Some(base + i);
                }
            }
            end = base;
        }
        None
    }

    pub fn index_of_byte(&self, byte: u8, from: usize) -> Option<usize> {
        self.index_of(&[byte], from)
    }

    pub fn last_index_of_byte(&self, byte: u8, from: usize) -> Option<usize> {
        self.last_index_of(&[byte], from)
    }

    fn matches_at(&self, offset: usize, needle: &[u8]) -> bool {
        needle
            .iter()
            .enumerate()
            .all(|(i, b)| self.get_u8_at(offset + i).is_ok_and(|v| v == *b))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining());
        for segment in self.readable() {
            segment.with_readable(|b| out.extend_from_slice(b));
        }
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.remaining());
        for segment in self.readable() {
            segment.with_readable(|b| out.extend_from_slice(b));
        }
        out.freeze()
    }

    /// Write segments into `sink` until it stops taking a whole segment.
    ///
    /// Returns the bytes taken. An error after some bytes went out is
    /// reported as the short count, the next call sees the error again.
    pub fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> std::io::Result<usize> {
        let mut total = 0;
        loop {
            self.settle_read();
            let segment = &mut self.segments[self.read_index];
            let before = segment.remaining();
            if before == 0 {
                return Ok(total);
            }
            match segment.write_to(sink) {
                Ok(n) => {
                    total += n;
                    if n < before {
                        return Ok(total);
                    }
                }
                Err(_) if total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn release(self) -> Result<()> {
        let mut first_err = None;
        for segment in self.segments {
            if let Err(e) = segment.release() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Readable for CompositeBuffer {
    fn remaining(&self) -> usize { self.readable().iter().map(|s| s.remaining()).sum() }

    fn read_u8(&mut self) -> Result<u8> {
        self.check_readable("read", 0, 1)?;
        self.settle_read();
        self.segments[self.read_index].read_u8()
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check_readable("read", 0, dst.len())?;
        let mut filled = 0;
        while filled < dst.len() {
            self.settle_read();
            filled += self.segments[self.read_index].read_available(&mut dst[filled..]);
        }
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.check_readable("skip", 0, n)?;
        let mut left = n;
        while left > 0 {
            self.settle_read();
            let segment = &mut self.segments[self.read_index];
            let take = left.min(segment.remaining());
            segment.skip(take)?;
            left -= take;
        }
        Ok(())
    }

    fn read_str(&mut self, len: usize, charset: Charset) -> Result<String> {
        self.check_readable("read string", 0, len)?;
        let mut decoder = Decoder::new(charset);
        let mut out = String::with_capacity(len);
        let mut left = len;
        while left > 0 {
            self.settle_read();
            let segment = &mut self.segments[self.read_index];
            let take = left.min(segment.remaining());
            segment
                .with_readable(|b| decoder.feed(&b[..take], &mut out))
                .context(EncodingSnafu)?;
            segment.skip(take)?;
            left -= take;
        }
        decoder.finish().context(EncodingSnafu)?;
        Ok(out)
    }
}

impl Writable for CompositeBuffer {
    fn write_u8(&mut self, value: u8) -> Result<()> { self.write_slice(&[value]) }

    fn write_slice(&mut self, src: &[u8]) -> Result<()> {
        self.check_usable()?;
        ensure!(
            !self.fixed || src.len() <= self.space(),
            FixedCapacitySnafu {
                capacity: self.capacity(),
                needed:   src.len(),
            }
        );
        let mut rest = src;
        loop {
            let n = self.segments[self.write_index].write_available(rest);
            rest = &rest[n..];
            if rest.is_empty() {
                return Ok(());
            }
            if self.write_index + 1 == self.segments.len() {
                self.grow(rest.len())?;
            }
            self.write_index += 1;
        }
    }
}

impl Debug for CompositeBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBuffer")
            .field("segments", &self.segments.len())
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .field("remaining", &self.remaining())
            .field("fixed", &self.fixed)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
