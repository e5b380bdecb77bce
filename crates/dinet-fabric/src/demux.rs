//! Class demultiplexer: REGISTER packets to the register sink, everything
//! else to the bypass sink.
//!
//! The class sits in the third header word, so the three header flits are
//! held before a route is chosen. Once chosen, the route is kept until the
//! packet's `last` flit has been forwarded; only one output moves per step.

use std::collections::VecDeque;

use dinet_core::wire::HEADER_WORDS;
use dinet_core::{Flit, PacketClass, PacketKind};

use crate::link::{FlitSink, FlitSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Register,
    Bypass,
}

impl Route {
    pub fn for_class(class: PacketClass) -> Self {
        match class {
            PacketClass::Register => Route::Register,
            _ => Route::Bypass,
        }
    }
}

#[derive(Debug)]
enum DemuxState {
    /// Collecting the header of the next packet.
    Header(Vec<Flit>),
    /// Forwarding a packet whose route is fixed.
    Forward {
        route: Route,
        pending: VecDeque<Flit>,
        tail_seen: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub register_packets: u64,
    pub bypass_packets: u64,
    /// Packets that ended before their third word.
    pub runts: u64,
}

#[derive(Debug)]
pub struct Demux {
    state: DemuxState,
    stats: DemuxStats,
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}

impl Demux {
    pub fn new() -> Self {
        Self {
            state: DemuxState::Header(Vec::with_capacity(HEADER_WORDS)),
            stats: DemuxStats::default(),
        }
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// The route of the packet in flight, if any.
    pub fn active_route(&self) -> Option<Route> {
        match &self.state {
            DemuxState::Forward { route, .. } => Some(*route),
            DemuxState::Header(_) => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(&self.state, DemuxState::Header(h) if h.is_empty())
    }

    /// One step. Returns the output that accepted a flit, if any.
    pub fn tick(
        &mut self,
        input: &mut dyn FlitSource,
        register: &mut dyn FlitSink,
        bypass: &mut dyn FlitSink,
    ) -> Option<Route> {
        if let DemuxState::Header(header) = &mut self.state {
            let flit = input.pop()?;
            header.push(flit);
            if header.len() < HEADER_WORDS {
                if flit.last {
                    self.stats.runts += 1;
                    tracing::warn!(words = header.len(), "dropping runt packet");
                    header.clear();
                }
                return None;
            }
            let class = PacketKind::class_of_flags_word(header[2].data);
            let route = Route::for_class(class);
            tracing::trace!(?route, %class, dest = header[0].data, "demux route chosen");
            let pending = std::mem::take(header).into();
            self.state = DemuxState::Forward {
                route,
                pending,
                tail_seen: flit.last,
            };
        }

        let DemuxState::Forward {
            route,
            pending,
            tail_seen,
        } = &mut self.state
        else {
            return None;
        };

        if pending.is_empty() && !*tail_seen {
            if let Some(flit) = input.pop() {
                *tail_seen = flit.last;
                pending.push_back(flit);
            }
        }

        let route = *route;
        let out: &mut dyn FlitSink = match route {
            Route::Register => register,
            Route::Bypass => bypass,
        };
        let flit = pending.front().copied()?;
        if out.push(flit).is_err() {
            return None;
        }
        pending.pop_front();

        if flit.last {
            match route {
                Route::Register => self.stats.register_packets += 1,
                Route::Bypass => self.stats.bypass_packets += 1,
            }
            self.state = DemuxState::Header(Vec::with_capacity(HEADER_WORDS));
        }
        Some(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::GatedSink;
    use dinet_core::reg::RegWidth;
    use dinet_core::{DiAddr, EventKind, Packet, RegKind, Subtype};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pkt(kind: PacketKind, len: usize) -> Packet {
        Packet::new(
            DiAddr::from_word(1),
            DiAddr::from_word(0x3ff),
            kind,
            (0..len as u16).collect(),
        )
    }

    fn split(received: &[Flit]) -> Vec<Packet> {
        received
            .split_inclusive(|f| f.last)
            .map(|run| Packet::from_flits(run).unwrap())
            .collect()
    }

    #[test]
    fn register_and_event_go_to_their_sinks() {
        let reg = pkt(PacketKind::Register(RegKind::ReadRequest(RegWidth::W16)), 1);
        let ev = pkt(PacketKind::Event(EventKind::LAST), 4);
        let mut input: VecDeque<Flit> = reg.to_flits().into_iter().chain(ev.to_flits()).collect();
        let mut r: Vec<Flit> = Vec::new();
        let mut b: Vec<Flit> = Vec::new();
        let mut demux = Demux::new();
        for _ in 0..32 {
            demux.tick(&mut input, &mut r, &mut b);
        }
        assert_eq!(split(&r), vec![reg]);
        assert_eq!(split(&b), vec![ev]);
        assert_eq!(demux.stats().register_packets, 1);
        assert_eq!(demux.stats().bypass_packets, 1);
        assert!(demux.is_idle());
    }

    #[test]
    fn runt_is_dropped_and_counted() {
        let mut input: VecDeque<Flit> = [Flit::word(1), Flit::tail(2)].into_iter().collect();
        let ok = pkt(PacketKind::Plain(Subtype::new(0).unwrap()), 0);
        input.extend(ok.to_flits());
        let mut r: Vec<Flit> = Vec::new();
        let mut b: Vec<Flit> = Vec::new();
        let mut demux = Demux::new();
        for _ in 0..16 {
            demux.tick(&mut input, &mut r, &mut b);
        }
        assert!(r.is_empty());
        assert_eq!(split(&b), vec![ok]);
        assert_eq!(demux.stats().runts, 1);
    }

    #[test]
    fn stalled_register_sink_does_not_corrupt_bypass() {
        let reg = pkt(PacketKind::Register(RegKind::WriteRequest(RegWidth::W16)), 2);
        let ev = pkt(PacketKind::Event(EventKind::LAST), 2);
        let mut input: VecDeque<Flit> = reg.to_flits().into_iter().chain(ev.to_flits()).collect();
        let mut r = GatedSink::default();
        let mut b = GatedSink { ready: true, received: Vec::new() };
        let mut demux = Demux::new();
        for _ in 0..20 {
            assert_ne!(demux.tick(&mut input, &mut r, &mut b), Some(Route::Bypass));
        }
        assert_eq!(demux.active_route(), Some(Route::Register));
        assert!(b.received.is_empty());

        r.ready = true;
        for _ in 0..20 {
            demux.tick(&mut input, &mut r, &mut b);
        }
        assert_eq!(split(&r.received), vec![reg]);
        assert_eq!(split(&b.received), vec![ev]);
    }

    fn arb_packet() -> impl Strategy<Value = Packet> {
        let kind = prop_oneof![
            (0u8..4).prop_map(|w| PacketKind::Register(RegKind::ReadRequest(RegWidth::from_index(w)))),
            Just(PacketKind::Register(RegKind::WriteSuccess)),
            Just(PacketKind::Event(EventKind::LAST)),
            Just(PacketKind::Event(EventKind::CONTINUATION)),
            (0u8..16).prop_map(|s| PacketKind::Plain(Subtype::new(s).unwrap())),
        ];
        (kind, 0usize..12).prop_map(|(k, len)| pkt(k, len))
    }

    proptest! {
        #[test]
        fn routing_is_exclusive_under_random_readiness(
            packets in proptest::collection::vec(arb_packet(), 1..20),
            seed in any::<u64>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut input: VecDeque<Flit> = packets.iter().flat_map(|p| p.to_flits()).collect();
            let mut r = GatedSink::default();
            let mut b = GatedSink::default();
            let mut demux = Demux::new();
            let total: usize = packets.iter().map(|p| p.len_words()).sum();

            for _ in 0..100_000 {
                r.ready = rng.gen_bool(0.6);
                b.ready = rng.gen_bool(0.6);
                let before = (r.received.len(), b.received.len());
                demux.tick(&mut input, &mut r, &mut b);
                let moved_r = r.received.len() - before.0;
                let moved_b = b.received.len() - before.1;
                prop_assert!(moved_r + moved_b <= 1);
                if r.received.len() + b.received.len() == total {
                    break;
                }
            }

            let (want_r, want_b): (Vec<Packet>, Vec<Packet>) = packets
                .into_iter()
                .partition(|p| p.class() == PacketClass::Register);
            prop_assert_eq!(split(&r.received), want_r);
            prop_assert_eq!(split(&b.received), want_b);
        }
    }
}
