//! Packet endpoints: turn whole packets into a flit stream and back.

use std::collections::VecDeque;

use dinet_core::{Flit, Packet, WireError};

use crate::link::{FlitSink, FlitSource};

/// Idle steps after which a reader reports that nothing arrived.
pub const READ_TIMEOUT_STEPS: u64 = 1000;

/// Queue of packets waiting to be sent, exposed flit by flit.
#[derive(Debug, Default)]
pub struct PacketWriter {
    flits: VecDeque<Flit>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, packet: &Packet) {
        self.flits.extend(packet.to_flits());
    }

    pub fn is_idle(&self) -> bool {
        self.flits.is_empty()
    }

    /// Push at most one flit into `output`.
    pub fn tick(&mut self, output: &mut dyn FlitSink) -> bool {
        crate::link::transfer(self, output).is_some()
    }
}

impl FlitSource for PacketWriter {
    fn peek(&self) -> Option<Flit> {
        self.flits.front().copied()
    }

    fn pop(&mut self) -> Option<Flit> {
        self.flits.pop_front()
    }
}

/// What a reader produced in one step.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing completed this step.
    Pending,
    Packet(Packet),
    /// A packet arrived but could not be decoded. It has been discarded.
    Malformed(WireError),
    /// No flit arrived for [`READ_TIMEOUT_STEPS`] consecutive steps.
    TimedOut,
}

/// Collects flits until `last` and decodes them into a packet.
#[derive(Debug)]
pub struct PacketReader {
    words: Vec<Flit>,
    idle_steps: u64,
    timeout_steps: u64,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketReader {
    pub fn new() -> Self {
        Self::with_timeout(READ_TIMEOUT_STEPS)
    }

    pub fn with_timeout(timeout_steps: u64) -> Self {
        Self {
            words: Vec::new(),
            idle_steps: 0,
            timeout_steps,
        }
    }

    /// True while part of a packet has been read.
    pub fn in_packet(&self) -> bool {
        !self.words.is_empty()
    }

    /// Take at most one flit from `input`.
    pub fn tick(&mut self, input: &mut dyn FlitSource) -> ReadOutcome {
        let Some(flit) = input.pop() else {
            self.idle_steps += 1;
            if self.idle_steps >= self.timeout_steps {
                self.idle_steps = 0;
                return ReadOutcome::TimedOut;
            }
            return ReadOutcome::Pending;
        };
        self.idle_steps = 0;
        self.words.push(flit);
        if !flit.last {
            return ReadOutcome::Pending;
        }
        let words = std::mem::take(&mut self.words);
        match Packet::from_flits(&words) {
            Ok(packet) => ReadOutcome::Packet(packet),
            Err(e) => {
                tracing::warn!(error = %e, words = words.len(), "discarding malformed packet");
                ReadOutcome::Malformed(e)
            }
        }
    }
}
