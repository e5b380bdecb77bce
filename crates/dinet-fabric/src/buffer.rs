//! Elastic buffer between two links.
//!
//! Overflow never drops data: a full buffer refuses the push and the
//! producer keeps its flit. In whole-packet mode nothing of a packet is
//! visible on the output until its `last` flit has been stored.

use std::collections::VecDeque;

use dinet_core::Flit;

use crate::error::FabricError;
use crate::link::{FlitSink, FlitSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Each flit is visible as soon as it is stored.
    Streaming,
    /// Only complete packets are visible.
    WholePacket,
}

/// Absolute fill levels that raise the two status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub almost_full: usize,
    pub almost_empty: usize,
}

#[derive(Debug)]
pub struct ElasticBuffer {
    fifo: VecDeque<Flit>,
    depth: usize,
    admission: Admission,
    /// Stored flits with `last` set, i.e. fully buffered packets.
    complete: usize,
    watermarks: Option<Watermarks>,
}

impl ElasticBuffer {
    pub fn streaming(depth: usize) -> Result<Self, FabricError> {
        if depth == 0 {
            return Err(FabricError::ZeroDepth);
        }
        Ok(Self::with_admission(depth, Admission::Streaming))
    }

    /// A buffer that only releases complete packets.
    ///
    /// `depth` must hold the longest packet, or a long packet could never
    /// complete and the buffer would stop making progress.
    pub fn whole_packet(depth: usize, max_packet_len: usize) -> Result<Self, FabricError> {
        if depth == 0 {
            return Err(FabricError::ZeroDepth);
        }
        if depth < max_packet_len {
            return Err(FabricError::BufferTooShallow {
                depth,
                max_packet_len,
            });
        }
        Ok(Self::with_admission(depth, Admission::WholePacket))
    }

    fn with_admission(depth: usize, admission: Admission) -> Self {
        Self {
            fifo: VecDeque::with_capacity(depth),
            depth,
            admission,
            complete: 0,
            watermarks: None,
        }
    }

    pub fn with_watermarks(mut self, watermarks: Watermarks) -> Self {
        self.watermarks = Some(watermarks);
        self
    }

    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.fifo.len() >= self.depth
    }

    pub fn complete_packets(&self) -> usize {
        self.complete
    }

    pub fn almost_full(&self) -> bool {
        self.watermarks
            .is_some_and(|w| self.fifo.len() >= w.almost_full)
    }

    pub fn almost_empty(&self) -> bool {
        self.watermarks
            .is_some_and(|w| self.fifo.len() <= w.almost_empty)
    }

    /// Length of the oldest packet in the buffer.
    ///
    /// While that packet is still arriving this is the number of its flits
    /// stored so far. Zero when empty.
    pub fn packet_size(&self) -> usize {
        self.fifo
            .iter()
            .position(|f| f.last)
            .map_or(self.fifo.len(), |i| i + 1)
    }

    /// One step: offer the head to `output`, then accept one flit from `input`.
    pub fn tick(&mut self, input: &mut dyn FlitSource, output: &mut dyn FlitSink) {
        if let Some(flit) = FlitSource::peek(self) {
            if output.push(flit).is_ok() {
                FlitSource::pop(self);
            }
        }
        if let Some(flit) = input.peek() {
            if FlitSink::push(self, flit).is_ok() {
                input.pop();
            }
        }
    }

    fn head_visible(&self) -> bool {
        match self.admission {
            Admission::Streaming => true,
            Admission::WholePacket => self.complete > 0,
        }
    }
}

impl FlitSink for ElasticBuffer {
    fn ready(&self) -> bool {
        !self.is_full()
    }

    fn push(&mut self, flit: Flit) -> Result<(), Flit> {
        if self.is_full() {
            return Err(flit);
        }
        if flit.last {
            self.complete += 1;
        }
        self.fifo.push_back(flit);
        Ok(())
    }
}

impl FlitSource for ElasticBuffer {
    fn peek(&self) -> Option<Flit> {
        if !self.head_visible() {
            return None;
        }
        self.fifo.front().copied()
    }

    fn pop(&mut self) -> Option<Flit> {
        if !self.head_visible() {
            return None;
        }
        let flit = self.fifo.pop_front()?;
        if flit.last {
            self.complete -= 1;
        }
        Some(flit)
    }
}
