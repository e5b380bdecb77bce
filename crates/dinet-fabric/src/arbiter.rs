//! Packet-atomic round-robin arbiter.
//!
//! Once an input wins, it keeps the output until its `last` flit has gone
//! through. The next grant starts searching after the previous winner.

use crate::link::{FlitSink, FlitSource};

#[derive(Debug, Default)]
pub struct PacketArbiter {
    granted: Option<usize>,
    next: usize,
}

impl PacketArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input currently holding the output.
    pub fn granted(&self) -> Option<usize> {
        self.granted
    }

    /// One step. Returns the index of the input that moved a flit.
    pub fn tick(
        &mut self,
        inputs: &mut [&mut dyn FlitSource],
        output: &mut dyn FlitSink,
    ) -> Option<usize> {
        let n = inputs.len();
        if n == 0 {
            return None;
        }
        let winner = match self.granted {
            Some(i) => i,
            None => {
                let i = (0..n)
                    .map(|k| (self.next + k) % n)
                    .find(|i| inputs[*i].peek().is_some())?;
                self.granted = Some(i);
                i
            }
        };

        let input = &mut *inputs[winner];
        let flit = input.peek()?;
        output.push(flit).ok()?;
        input.pop();
        if flit.last {
            self.granted = None;
            self.next = (winner + 1) % n;
        }
        Some(winner)
    }
}
