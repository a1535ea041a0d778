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

//! Deficit round robin over one base queue and a set of weighted queues.
//!
//! Every round starts at the base queue, which is drained without limit. The
//! bytes it sent become the round's quantum (or the configured bonus when it
//! had nothing), and each weighted queue with data earns
//! `quantum * weight / 100` of deficit it may spend on whole items.

use std::{
    fmt::{Debug, Formatter},
    io::{ErrorKind, Write},
};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use snafu::{ensure, ResultExt};
use tessera_common::{Priority, BASE_WEIGHT};
use tracing::{debug, trace};

use crate::{
    config::WriteQueueConfig,
    err::{InvalidPrioritySnafu, Result, SinkSnafu},
    transmit::Transmit,
};

type Item = Box<dyn Transmit>;

/// What the caller should do after [WriteQueue::flush].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Every queue is empty.
    Flushed,
    /// The sink stopped taking bytes, retry once it is writable again.
    Flushing,
    /// Some queue ran out of deficit with data left, retry right away.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Base,
    Weighted(usize),
}

enum Progress {
    Done(usize),
    Blocked(usize),
}

// Consumer side, only touched under the flush lock.
struct FlushState {
    stage:        Stage,
    // Items popped but not fully written.
    base_head:    Option<Item>,
    heads:        Vec<Option<Item>>,
    deficits:     Vec<usize>,
    // Whether queue `i` already got its quantum this round.
    credited:     Vec<bool>,
    base_quantum: usize,
    skipped:      bool,
    last_flushed: usize,
}

impl FlushState {
    fn new(queues: usize) -> Self {
        Self {
            stage:        Stage::Base,
            base_head:    None,
            heads:        (0..queues).map(|_| None).collect(),
            deficits:     vec![0; queues],
            credited:     vec![false; queues],
            base_quantum: 0,
            skipped:      false,
            last_flushed: 0,
        }
    }
}

/// Fair multiplexing of prioritized outbound items onto one sink.
///
/// [WriteQueue::offer] may be called from any thread. [WriteQueue::flush]
/// belongs to the thread that owns the sink, concurrent flushes serialize on
/// an internal lock.
pub struct WriteQueue {
    base:     SegQueue<Item>,
    weighted: Vec<SegQueue<Item>>,
    weights:  Vec<u32>,
    bonus:    usize,
    state:    Mutex<FlushState>,
}

impl WriteQueue {
    pub fn new(config: &WriteQueueConfig) -> Result<Self> {
        let weights = config.normalized_weights()?;
        let bonus = config.base_quantum_bonus.as_bytes_usize();
        debug!(
            "write queue created with weights {:?}, base quantum bonus {}",
            weights, config.base_quantum_bonus
        );
        Ok(Self {
            base: SegQueue::new(),
            weighted: weights.iter().map(|_| SegQueue::new()).collect(),
            state: Mutex::new(FlushState::new(weights.len())),
            weights,
            bonus,
        })
    }

    /// Number of weighted queues, valid priorities are `0..queue_count()`.
    pub fn queue_count(&self) -> usize { self.weighted.len() }

    pub fn weights(&self) -> &[u32] { &self.weights }

    /// Enqueue `item` on the base queue (`None`) or weighted queue
    /// `priority`.
    pub fn offer<T: Transmit + 'static>(&self, priority: Option<Priority>, item: T) -> Result<()> {
        self.offer_boxed(priority, Box::new(item))
    }

    pub fn offer_boxed(&self, priority: Option<Priority>, item: Box<dyn Transmit>) -> Result<()> {
        match priority {
            None => self.base.push(item),
            Some(priority) => {
                ensure!(
                    priority < self.weighted.len(),
                    InvalidPrioritySnafu {
                        priority,
                        queues: self.weighted.len(),
                    }
                );
                self.weighted[priority].push(item);
            }
        }
        Ok(())
    }

    /// Write as much as fairness and the sink allow.
    pub fn flush(&self, sink: &mut dyn Write) -> Result<FlushStatus> {
        let mut state = self.state.lock();
        let mut flushed = 0;
        let status = self.run(&mut state, sink, &mut flushed);
        state.last_flushed = flushed;
        trace!("flushed {} bytes: {:?}", flushed, status);
        status
    }

    fn run(
        &self,
        state: &mut FlushState,
        sink: &mut dyn Write,
        flushed: &mut usize,
    ) -> Result<FlushStatus> {
        loop {
            if state.stage == Stage::Base {
                if !self.drain_base(state, sink, flushed)? {
                    return Ok(FlushStatus::Flushing);
                }
                state.credited.fill(false);
                state.skipped = false;
                state.stage = Stage::Weighted(0);
            }
            while let Stage::Weighted(i) = state.stage {
                if i >= self.weighted.len() {
                    break;
                }
                if !self.service(i, state, sink, flushed)? {
                    return Ok(FlushStatus::Flushing);
                }
                state.stage = Stage::Weighted(i + 1);
            }
            state.stage = Stage::Base;
            if self.base.is_empty() {
                return Ok(if state.skipped {
                    FlushStatus::Skipped
                } else {
                    FlushStatus::Flushed
                });
            }
        }
    }

    // False when the sink blocked.
    fn drain_base(
        &self,
        state: &mut FlushState,
        sink: &mut dyn Write,
        flushed: &mut usize,
    ) -> Result<bool> {
        let mut pending = false;
        let mut sent = 0;
        while let Some(mut item) = state.base_head.take().or_else(|| self.base.pop()) {
            pending = true;
            match drain_item(&mut item, sink) {
                Ok(Progress::Done(n)) => {
                    sent += n;
                    *flushed += n;
                }
                Ok(Progress::Blocked(n)) => {
                    *flushed += n;
                    state.base_head = Some(item);
                    return Ok(false);
                }
                Err(e) => {
                    state.base_head = Some(item);
                    return Err(e);
                }
            }
        }
        state.base_quantum = if pending { sent } else { self.bonus };
        Ok(true)
    }

    // False when the sink blocked.
    fn service(
        &self,
        i: usize,
        state: &mut FlushState,
        sink: &mut dyn Write,
        flushed: &mut usize,
    ) -> Result<bool> {
        let queue = &self.weighted[i];
        if state.heads[i].is_none() && queue.is_empty() {
            state.deficits[i] = 0;
            return Ok(true);
        }
        if !state.credited[i] {
            state.deficits[i] +=
                state.base_quantum * self.weights[i] as usize / BASE_WEIGHT as usize;
            state.credited[i] = true;
        }
        loop {
            let Some(mut item) = state.heads[i].take().or_else(|| queue.pop()) else {
                state.deficits[i] = 0;
                return Ok(true);
            };
            if item.pending_bytes() > state.deficits[i] {
                state.heads[i] = Some(item);
                state.skipped = true;
                return Ok(true);
            }
            match drain_item(&mut item, sink) {
                Ok(Progress::Done(n)) => {
                    state.deficits[i] = state.deficits[i].saturating_sub(n);
                    *flushed += n;
                }
                Ok(Progress::Blocked(n)) => {
                    state.deficits[i] = state.deficits[i].saturating_sub(n);
                    *flushed += n;
                    state.heads[i] = Some(item);
                    return Ok(false);
                }
                Err(e) => {
                    state.heads[i] = Some(item);
                    return Err(e);
                }
            }
        }
    }

    /// Items waiting, including ones partly written.
    pub fn pending_items(&self) -> usize {
        let state = self.state.lock();
        let heads = state.base_head.iter().count() + state.heads.iter().flatten().count();
        heads + self.base.len() + self.weighted.iter().map(SegQueue::len).sum::<usize>()
    }

    /// Deficit of weighted queue `priority`.
    pub fn deficit(&self, priority: Priority) -> Option<usize> {
        self.state.lock().deficits.get(priority).copied()
    }

    /// Bytes written by the most recent flush.
    pub fn last_flushed(&self) -> usize { self.state.lock().last_flushed }

    /// Drop every unsent item and reset the round. Returns how many items
    /// were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let mut dropped = state.base_head.take().into_iter().count();
        for head in state.heads.iter_mut() {
            dropped += head.take().into_iter().count();
        }
        while self.base.pop().is_some() {
            dropped += 1;
        }
        for queue in &self.weighted {
            while queue.pop().is_some() {
                dropped += 1;
            }
        }
        state.deficits.fill(0);
        state.credited.fill(false);
        state.stage = Stage::Base;
        state.skipped = false;
        if dropped > 0 {
            debug!("write queue cleared, {} unsent items dropped", dropped);
        }
        dropped
    }
}

fn drain_item(item: &mut Item, sink: &mut dyn Write) -> Result<Progress> {
    let mut written = 0;
    while item.pending_bytes() > 0 {
        match item.transmit(sink) {
            Ok(0) => return Ok(Progress::Blocked(written)),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Progress::Blocked(written)),
            Err(e) => return Err(e).context(SinkSnafu),
        }
    }
    Ok(Progress::Done(written))
}

impl Debug for WriteQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("weights", &self.weights)
            .field("bonus", &self.bonus)
            .field("base_len", &self.base.len())
            .finish()
    }
}
