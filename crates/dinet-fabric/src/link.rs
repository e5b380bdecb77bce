//! Links and the port traits every fabric component is wired through.
//!
//! A transfer happens when the producer offers a flit and the consumer side
//! is ready. Producers peek their source, try to push, and pop only once
//! the push was accepted, so a refused flit is never lost.

use std::collections::VecDeque;

use dinet_core::Flit;

/// Anything a component reads flits from.
pub trait FlitSource {
    /// The flit that would be delivered next, without taking it.
    fn peek(&self) -> Option<Flit>;
    fn pop(&mut self) -> Option<Flit>;
}

/// Anything a component writes flits into.
pub trait FlitSink {
    fn ready(&self) -> bool;
    /// Hand over a flit. A sink that is not ready gives it back.
    fn push(&mut self, flit: Flit) -> Result<(), Flit>;
}

/// Move at most one flit from `src` to `dst`. Returns the flit moved.
pub fn transfer(src: &mut dyn FlitSource, dst: &mut dyn FlitSink) -> Option<Flit> {
    let flit = src.peek()?;
    dst.push(flit).ok()?;
    src.pop()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub transfers: u64,
    /// Pushes refused because the slot was still occupied.
    pub stalls: u64,
}

/// Single-slot point-to-point link.
///
/// The consumer signals ready by having emptied the slot.
#[derive(Debug, Default)]
pub struct Link {
    slot: Option<Flit>,
    stats: LinkStats,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.slot.is_some()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

impl FlitSink for Link {
    fn ready(&self) -> bool {
        self.slot.is_none()
    }

    fn push(&mut self, flit: Flit) -> Result<(), Flit> {
        if self.slot.is_some() {
            self.stats.stalls += 1;
            return Err(flit);
        }
        self.slot = Some(flit);
        self.stats.transfers += 1;
        Ok(())
    }
}

impl FlitSource for Link {
    fn peek(&self) -> Option<Flit> {
        self.slot
    }

    fn pop(&mut self) -> Option<Flit> {
        self.slot.take()
    }
}

// ── Plain collections ─────────────────────────────────────────────────────────

/// Always ready. Used as a capture port in tests and drivers.
impl FlitSink for Vec<Flit> {
    fn ready(&self) -> bool {
        true
    }

    fn push(&mut self, flit: Flit) -> Result<(), Flit> {
        Vec::push(self, flit);
        Ok(())
    }
}

impl FlitSink for VecDeque<Flit> {
    fn ready(&self) -> bool {
        true
    }

    fn push(&mut self, flit: Flit) -> Result<(), Flit> {
        self.push_back(flit);
        Ok(())
    }
}

impl FlitSource for VecDeque<Flit> {
    fn peek(&self) -> Option<Flit> {
        self.front().copied()
    }

    fn pop(&mut self) -> Option<Flit> {
        self.pop_front()
    }
}

/// A sink that only accepts while the consumer holds `ready` high.
#[derive(Debug, Default)]
pub struct GatedSink {
    pub ready: bool,
    pub received: Vec<Flit>,
}

impl FlitSink for GatedSink {
    fn ready(&self) -> bool {
        self.ready
    }

    fn push(&mut self, flit: Flit) -> Result<(), Flit> {
        if !self.ready {
            return Err(flit);
        }
        self.received.push(flit);
        Ok(())
    }
}
