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

//! End to end scenarios across the pool, the codec buffers and the write
//! queue, plus the non-blocking sink they run against.

use std::io::{self, ErrorKind, Read, Write};

use tracing::trace;

/// A non-blocking channel stand-in: takes at most `window` bytes per
/// [ThrottledSink::open] and answers `WouldBlock` after that.
#[derive(Debug, Default)]
pub struct ThrottledSink {
    written: Vec<u8>,
    window:  usize,
    budget:  usize,
    read_at: usize,
}

impl ThrottledSink {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            budget: window,
            ..Default::default()
        }
    }

    /// The channel became writable again.
    pub fn open(&mut self) { self.budget = self.window; }

    pub fn written(&self) -> &[u8] { &self.written }
}

impl Write for ThrottledSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.budget);
        self.written.extend_from_slice(&buf[..n]);
        self.budget -= n;
        trace!("sink took {} bytes, {} left in window", n, self.budget);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

/// The far end of the channel reads back what was written.
impl Read for ThrottledSink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let unread = &self.written[self.read_at..];
        if unread.is_empty() {
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = unread.len().min(buf.len());
        buf[..n].copy_from_slice(&unread[..n]);
        self.read_at += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rstest::rstest;
    use tessera_buffer::{
        err::Error as BufferError, vbc, ChunkManagerRef, CodecBuffer, CompositeBuffer, Readable,
        StorageKind, Writable,
    };
    use tessera_transport::{FlushStatus, TransportConfig, WriteQueue};
    use tessera_utils::logger::install_fmt_log;

    use super::*;

    fn config(storage: &str) -> TransportConfig {
        TransportConfig::from_toml_str(&format!(
            r#"
            [pool]
            max_pooled_size = "4KiB"
            bucket_capacity = 32
            storage = "{storage}"

            [write_queue]
            weights = [1.0, 0.5]
            base_quantum_bonus = "2KiB"
            "#
        ))
        .unwrap()
    }

    fn frame(manager: &ChunkManagerRef, id: i32, text: &str) -> CodecBuffer {
        let mut body = CodecBuffer::with_default_capacity(&**manager).unwrap();
        body.write_vbc_i32(id).unwrap();
        body.write_string(Some(text)).unwrap();

        let mut header = CodecBuffer::allocate(&**manager, 8).unwrap();
        header.write_vbc_i32(body.remaining() as i32).unwrap();
        body.add_first(&header).unwrap();
        body
    }

    // Pull everything the sink holds into a composite, one small read at a
    // time, the way a loop would wrap inbound bytes.
    fn receive(manager: &ChunkManagerRef, sink: &mut ThrottledSink) -> CompositeBuffer {
        let mut inbound = CompositeBuffer::new(manager.clone(), 16).unwrap();
        loop {
            let segment = CodecBuffer::read_from(&**manager, sink, 37).unwrap();
            if segment.is_empty() {
                break;
            }
            inbound.push_segment(segment).unwrap();
        }
        inbound
    }

    fn decode(inbound: &mut CompositeBuffer) -> Vec<(i32, String)> {
        let mut frames = Vec::new();
        while inbound.remaining() > 0 {
            let len = inbound.read_vbc_i32_required().unwrap() as usize;
            let mut body = inbound.slice(len).unwrap();
            let id = body.read_vbc_i32_required().unwrap();
            let text = body.read_string().unwrap().unwrap();
            assert_eq!(body.remaining(), 0);
            frames.push((id, text));
        }
        frames
    }

    #[test]
    fn hello_over_the_wire() {
        install_fmt_log();
        let config = config("heap");
        let manager = config.new_chunk_manager().unwrap();

        let mut buf = CodecBuffer::with_default_capacity(&*manager).unwrap();
        buf.write_string(Some("hello")).unwrap();
        buf.write_vbc_i32(-229).unwrap();
        assert_eq!(&buf.to_vec()[6..], &[0b0110_0101, 0b1000_0011]);
        assert_eq!(&vbc::encode_i32(-229)[..], &[0b0110_0101, 0b1000_0011]);

        let queue = WriteQueue::new(&config.write_queue).unwrap();
        queue.offer(None, buf).unwrap();
        let mut sink = ThrottledSink::new(3);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match queue.flush(&mut sink).unwrap() {
                FlushStatus::Flushed => break,
                FlushStatus::Flushing => sink.open(),
                FlushStatus::Skipped => {}
            }
        }
        assert_eq!(attempts, 3);

        let mut inbound = receive(&manager, &mut sink);
        assert_eq!(inbound.read_string().unwrap().as_deref(), Some("hello"));
        assert_eq!(inbound.read_vbc_i32().unwrap(), Some(-229));
        assert_eq!(inbound.remaining(), 0);

        drop(inbound);
        assert_eq!(manager.outstanding(), 0);
        manager.close().unwrap();
    }

    #[rstest]
    #[case::heap("heap")]
    #[case::native("native")]
    fn framed_messages_round_trip(#[case] storage: &str) {
        install_fmt_log();
        let config = config(storage);
        assert_eq!(
            config.pool.storage,
            if storage == "heap" { StorageKind::Heap } else { StorageKind::Native }
        );
        let manager = config.new_chunk_manager().unwrap();
        let queue = WriteQueue::new(&config.write_queue).unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut sent = Vec::new();
        for id in 0..120 {
            let text: String = (0..rng.gen_range(0..90))
                .map(|_| rng.gen_range('a'..='z'))
                .collect();
            let priority = match id % 3 {
                0 => None,
                p => Some(p as usize - 1),
            };
            queue.offer(priority, frame(&manager, id, &text)).unwrap();
            sent.push((id, text));
        }

        let mut sink = ThrottledSink::new(512);
        while queue.flush(&mut sink).unwrap() != FlushStatus::Flushed {
            sink.open();
        }
        assert_eq!(queue.pending_items(), 0);

        let mut inbound = receive(&manager, &mut sink);
        assert!(inbound.segment_count() > 1);
        let mut received = decode(&mut inbound);
        assert_eq!(received.len(), sent.len());
        received.sort();
        assert_eq!(received, sent);

        drop(inbound);
        assert_eq!(manager.outstanding(), 0);
        manager.close().unwrap();
    }

    #[test]
    fn weighted_share_of_a_busy_channel() {
        let config = config("heap");
        let manager = config.new_chunk_manager().unwrap();
        let queue = WriteQueue::new(&config.write_queue).unwrap();
        for id in 0..3000 {
            queue.offer(Some(0), frame(&manager, id, "high")).unwrap();
            queue.offer(Some(1), frame(&manager, -id - 1, "low!")).unwrap();
        }

        let mut sink = ThrottledSink::new(usize::MAX);
        for _ in 0..3 {
            assert_eq!(queue.flush(&mut sink).unwrap(), FlushStatus::Skipped);
        }
        let mut inbound = receive(&manager, &mut sink);
        let frames = decode(&mut inbound);
        let high = frames.iter().filter(|(id, _)| *id >= 0).count() as f64;
        let low = frames.iter().filter(|(id, _)| *id < 0).count() as f64;
        assert!((1.8..2.2).contains(&(high / low)), "{} / {}", high, low);

        assert_eq!(queue.clear(), 6000 - frames.len());
        drop(inbound);
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn close_reports_leaked_buffers() {
        let manager = config("heap").new_chunk_manager().unwrap();
        let a = CodecBuffer::allocate(&*manager, 100).unwrap();
        let b = a.duplicate().unwrap();
        let c = CodecBuffer::allocate(&*manager, 10_000).unwrap();

        let err = manager.close().unwrap_err();
        assert!(matches!(err, BufferError::OutstandingChunks { count: 2, .. }));

        drop(a);
        drop(b);
        c.release().unwrap();
        manager.close().unwrap();
        assert!(matches!(
            CodecBuffer::allocate(&*manager, 1).unwrap_err(),
            BufferError::ManagerClosed { .. }
        ));
    }
}
