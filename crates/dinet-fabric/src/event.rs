//! Event fragmentation and reassembly.
//!
//! An event longer than one packet goes out as a run of EVENT packets that
//! share source and destination. Every packet but the last carries the
//! continuation subclass. The receiver concatenates payloads in arrival
//! order until a packet without it shows up.

use std::collections::HashMap;

use dinet_core::{DiAddr, EventKind, Packet, PacketClass, PacketKind};

/// Split `payload` into EVENT packets of at most `max_payload_words` words.
///
/// An empty payload still produces one (empty) final packet.
pub fn fragment(
    dest: DiAddr,
    src: DiAddr,
    payload: &[u16],
    max_payload_words: usize,
) -> Result<Vec<Packet>, FragmentError> {
    fragment_with(dest, src, payload, max_payload_words, EventKind::LAST)
}

/// Like [`fragment`], marking the final packet with `final_kind`.
pub fn fragment_with(
    dest: DiAddr,
    src: DiAddr,
    payload: &[u16],
    max_payload_words: usize,
    final_kind: EventKind,
) -> Result<Vec<Packet>, FragmentError> {
    if max_payload_words == 0 {
        return Err(FragmentError::ZeroLimit);
    }
    if final_kind.is_continuation() {
        return Err(FragmentError::ContinuationAsFinal);
    }
    if payload.is_empty() {
        return Ok(vec![Packet::new(dest, src, PacketKind::Event(final_kind), Vec::new())]);
    }
    let chunks = payload.chunks(max_payload_words);
    let count = chunks.len();
    Ok(chunks
        .enumerate()
        .map(|(i, chunk)| {
            let kind = if i + 1 == count {
                final_kind
            } else {
                EventKind::CONTINUATION
            };
            Packet::new(dest, src, PacketKind::Event(kind), chunk.to_vec())
        })
        .collect())
}

/// A complete event put back together from its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub src: DiAddr,
    pub dest: DiAddr,
    /// Subclass of the final packet.
    pub kind: EventKind,
    pub payload: Vec<u16>,
    /// Number of packets the event arrived in.
    pub packets: usize,
}

impl Event {
    /// The event as one (possibly oversized) EVENT packet.
    pub fn into_packet(self) -> Packet {
        Packet::new(self.dest, self.src, PacketKind::Event(self.kind), self.payload)
    }
}

#[derive(Debug, Default)]
struct Run {
    payload: Vec<u16>,
    packets: usize,
}

/// Per-sender reassembly of fragmented events.
#[derive(Debug, Default)]
pub struct Reassembler {
    runs: HashMap<(DiAddr, DiAddr), Run>,
    word_limit: Option<usize>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort any run that grows beyond `words` payload words.
    pub fn with_word_limit(words: usize) -> Self {
        Self {
            runs: HashMap::new(),
            word_limit: Some(words),
        }
    }

    /// Runs started but not yet finished.
    pub fn pending_runs(&self) -> usize {
        self.runs.len()
    }

    /// Feed one EVENT packet. Returns the event once its run is complete.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Event>, FragmentError> {
        let PacketKind::Event(kind) = packet.kind else {
            return Err(FragmentError::NotAnEvent(packet.class()));
        };
        let key = (packet.src, packet.dest);
        let run = self.runs.entry(key).or_default();
        run.payload.extend_from_slice(&packet.payload);
        run.packets += 1;

        if let Some(limit) = self.word_limit {
            if run.payload.len() > limit {
                let words = run.payload.len();
                self.runs.remove(&key);
                tracing::warn!(src = %packet.src, dest = %packet.dest, words, limit, "event run too long; discarded");
                return Err(FragmentError::RunTooLong {
                    src: packet.src,
                    dest: packet.dest,
                    limit,
                });
            }
        }

        if kind.is_continuation() {
            return Ok(None);
        }
        let run = self.runs.remove(&key).unwrap_or_default();
        Ok(Some(Event {
            src: packet.src,
            dest: packet.dest,
            kind,
            payload: run.payload,
            packets: run.packets,
        }))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("per-packet payload limit must be at least one word")]
    ZeroLimit,

    #[error("the final packet of an event cannot carry the continuation subclass")]
    ContinuationAsFinal,

    #[error("{0} packet passed to event reassembly")]
    NotAnEvent(PacketClass),

    #[error("event run {src} -> {dest} exceeded {limit} words")]
    RunTooLong { src: DiAddr, dest: DiAddr, limit: usize },
}
