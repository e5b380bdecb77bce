//! A debug module as wired inside a subnet.
//!
//!   input ─▶ whole-packet buffer ─▶ demux ─┬─▶ register engine ─┐
//!                                          └─▶ event inbox       ├─▶ arbiter ─▶ output
//!                                              event outbox ─────┘

use std::collections::VecDeque;

use dinet_core::reg::base;
use dinet_core::wire::max_payload_words;
use dinet_core::{DiAddr, ModuleIdentity, Packet};

use crate::arbiter::PacketArbiter;
use crate::backend::DynBackend;
use crate::buffer::ElasticBuffer;
use crate::demux::Demux;
use crate::endpoint::{PacketReader, PacketWriter, ReadOutcome};
use crate::error::FabricError;
use crate::event;
use crate::link::{FlitSink, Link};
use crate::regaccess::{EngineConfig, RegAccessEngine};

/// Received non-register packets kept until someone takes them.
pub const INBOX_DEPTH: usize = 64;

pub struct DebugModule {
    address: DiAddr,
    max_packet_len: usize,
    input: ElasticBuffer,
    demux: Demux,
    to_engine: Link,
    to_events: Link,
    engine: RegAccessEngine<DynBackend>,
    from_engine: Link,
    event_reader: PacketReader,
    inbox: VecDeque<Packet>,
    inbox_dropped: u64,
    outbox: PacketWriter,
    arbiter: PacketArbiter,
}

impl DebugModule {
    pub fn new(
        address: DiAddr,
        config: EngineConfig,
        backend: DynBackend,
        buffer_depth: usize,
        max_packet_len: usize,
    ) -> Result<Self, FabricError> {
        if max_payload_words(max_packet_len) == 0 {
            return Err(FabricError::PacketLimitTooSmall(max_packet_len));
        }
        Ok(Self {
            address,
            max_packet_len,
            input: ElasticBuffer::whole_packet(buffer_depth, max_packet_len)?,
            demux: Demux::new(),
            to_engine: Link::new(),
            to_events: Link::new(),
            engine: RegAccessEngine::new(config, backend),
            from_engine: Link::new(),
            event_reader: PacketReader::new(),
            inbox: VecDeque::with_capacity(INBOX_DEPTH),
            inbox_dropped: 0,
            outbox: PacketWriter::new(),
            arbiter: PacketArbiter::new(),
        })
    }

    pub fn address(&self) -> DiAddr {
        self.address
    }

    pub fn identity(&self) -> ModuleIdentity {
        let regs = self.engine.registers();
        ModuleIdentity {
            vendor: regs.read(base::MOD_VENDOR).unwrap_or_default().into(),
            module_type: regs.read(base::MOD_TYPE).unwrap_or_default().into(),
            version: regs.read(base::MOD_VERSION).unwrap_or_default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.engine.registers().is_active()
    }

    pub fn engine(&self) -> &RegAccessEngine<DynBackend> {
        &self.engine
    }

    /// The module's input port.
    pub fn input_mut(&mut self) -> &mut dyn FlitSink {
        &mut self.input
    }

    /// Non-register packets this module has received.
    pub fn take_inbox(&mut self) -> Vec<Packet> {
        self.inbox.drain(..).collect()
    }

    /// Packets discarded because the inbox was full.
    pub fn inbox_dropped(&self) -> u64 {
        self.inbox_dropped
    }

    /// Queue an event for the configured event destination.
    ///
    /// Refused while the module is not active. Returns the number of
    /// packets the event was split into.
    pub fn emit_event(&mut self, payload: &[u16]) -> Result<usize, FabricError> {
        if !self.is_active() {
            return Err(FabricError::ModuleInactive(self.address));
        }
        let dest = DiAddr::from_word(self.engine.registers().event_dest());
        let packets = event::fragment(
            dest,
            self.address,
            payload,
            max_payload_words(self.max_packet_len),
        )?;
        for p in &packets {
            self.outbox.enqueue(p);
        }
        tracing::debug!(module = %self.address, %dest, words = payload.len(), packets = packets.len(), "event queued");
        Ok(packets.len())
    }

    pub fn is_idle(&self) -> bool {
        self.input.is_empty()
            && self.demux.is_idle()
            && !self.to_engine.is_valid()
            && !self.to_events.is_valid()
            && self.engine.is_idle()
            && !self.from_engine.is_valid()
            && self.outbox.is_idle()
            && !self.event_reader.in_packet()
    }

    /// One step. Stages run from the output backwards so each flit
    /// advances at most one stage per step.
    pub fn tick(&mut self, output: &mut dyn FlitSink) {
        self.arbiter
            .tick(&mut [&mut self.from_engine, &mut self.outbox], output);
        self.engine.tick(&mut self.to_engine, &mut self.from_engine);
        match self.event_reader.tick(&mut self.to_events) {
            ReadOutcome::Packet(p) => {
                tracing::debug!(module = %self.address, packet = %p, "packet received on event path");
                if self.inbox.len() >= INBOX_DEPTH {
                    self.inbox_dropped += 1;
                    tracing::warn!(module = %self.address, dropped = self.inbox_dropped, "inbox full; dropping packet");
                } else {
                    self.inbox.push_back(p);
                }
            }
            ReadOutcome::Pending | ReadOutcome::TimedOut | ReadOutcome::Malformed(_) => {}
        }
        self.demux
            .tick(&mut self.input, &mut self.to_engine, &mut self.to_events);
    }
}
