//! Register access engine.
//!
//! Serves one register transaction at a time:
//!
//!   Idle → Decode → Dispatch → AwaitBackend → Respond → Idle
//!
//! Each step performs at most one transition. Every malformed or refused
//! request is answered with the error subclass matching its operation; the
//! engine itself never fails. The next request is only read once the
//! previous response has left completely.

use std::task::Poll;

use dinet_core::reg::{base, DEFAULT_BACKEND_BOUNDARY};
use dinet_core::{ModuleIdentity, Packet, PacketKind, RegKind, RegOp, RegWidth, RegisterTransaction};

use crate::backend::{BackendFault, RegisterBackend};
use crate::endpoint::{PacketReader, PacketWriter, ReadOutcome};
use crate::link::{FlitSink, FlitSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Decode,
    Dispatch,
    AwaitBackend,
    Respond,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub identity: ModuleIdentity,
    /// Whether the control register's active bit can be cleared.
    pub can_stall: bool,
    pub max_reg_width: RegWidth,
    pub backend_boundary: u16,
}

impl EngineConfig {
    pub fn new(identity: ModuleIdentity) -> Self {
        Self {
            identity,
            can_stall: true,
            max_reg_width: RegWidth::W128,
            backend_boundary: DEFAULT_BACKEND_BOUNDARY,
        }
    }
}

/// The registers every module owns itself.
#[derive(Debug, Clone)]
pub struct BaseRegisters {
    identity: ModuleIdentity,
    can_stall: bool,
    cs: u16,
    event_dest: u16,
}

impl BaseRegisters {
    pub fn new(identity: ModuleIdentity, can_stall: bool) -> Self {
        Self {
            identity,
            can_stall,
            // A module that cannot stall is always running.
            cs: if can_stall { 0 } else { base::CS_ACTIVE },
            event_dest: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cs & base::CS_ACTIVE != 0
    }

    pub fn event_dest(&self) -> u16 {
        self.event_dest
    }

    pub fn read(&self, address: u16) -> Result<u16, BackendFault> {
        match address {
            base::MOD_VENDOR => Ok(self.identity.vendor.raw()),
            base::MOD_TYPE => Ok(self.identity.module_type.raw()),
            base::MOD_VERSION => Ok(self.identity.version),
            base::MOD_CS => Ok(self.cs),
            base::MOD_EVENT_DEST => Ok(self.event_dest),
            other => Err(BackendFault::Unimplemented(other)),
        }
    }

    pub fn write(&mut self, address: u16, value: u16) -> Result<(), BackendFault> {
        match address {
            base::MOD_VENDOR | base::MOD_TYPE | base::MOD_VERSION => {
                Err(BackendFault::ReadOnly(address))
            }
            base::MOD_CS => {
                if self.can_stall {
                    self.cs = value;
                }
                Ok(())
            }
            base::MOD_EVENT_DEST => {
                self.event_dest = value & base::EVENT_DEST_MASK;
                Ok(())
            }
            other => Err(BackendFault::Unimplemented(other)),
        }
    }

    fn access(&mut self, txn: &RegisterTransaction) -> Result<u128, BackendFault> {
        match txn.op {
            RegOp::Read => self.read(txn.address).map(u128::from),
            RegOp::Write(value) => self.write(txn.address, value as u16).map(|()| value),
        }
    }
}

/// Why a request was answered with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    Malformed,
    WidthExceedsMax(RegWidth),
    InternalTooWide(RegWidth),
    Backend(BackendFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Internal,
    Backend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub requests: u64,
    pub errors: u64,
    pub discarded: u64,
}

pub struct RegAccessEngine<B> {
    config: EngineConfig,
    regs: BaseRegisters,
    backend: B,
    state: EngineState,
    reader: PacketReader,
    writer: PacketWriter,
    request: Option<Packet>,
    txn: Option<RegisterTransaction>,
    target: Target,
    outcome: Option<Result<u128, Refusal>>,
    stats: EngineStats,
}

impl<B: RegisterBackend> RegAccessEngine<B> {
    pub fn new(config: EngineConfig, backend: B) -> Self {
        Self {
            regs: BaseRegisters::new(config.identity, config.can_stall),
            config,
            backend,
            state: EngineState::Idle,
            reader: PacketReader::new(),
            writer: PacketWriter::new(),
            request: None,
            txn: None,
            target: Target::Internal,
            outcome: None,
            stats: EngineStats::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn registers(&self) -> &BaseRegisters {
        &self.regs
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn is_idle(&self) -> bool {
        self.state == EngineState::Idle && !self.reader.in_packet()
    }

    /// One step.
    pub fn tick(&mut self, input: &mut dyn FlitSource, output: &mut dyn FlitSink) {
        let next = match self.state {
            EngineState::Idle => self.idle(input),
            EngineState::Decode => self.decode(),
            EngineState::Dispatch => self.dispatch(),
            EngineState::AwaitBackend => self.await_backend(),
            EngineState::Respond => self.respond(output),
        };
        if next != self.state {
            tracing::trace!(from = ?self.state, to = ?next, "register engine transition");
            self.state = next;
        }
    }

    fn idle(&mut self, input: &mut dyn FlitSource) -> EngineState {
        match self.reader.tick(input) {
            ReadOutcome::Packet(packet) => {
                self.request = Some(packet);
                EngineState::Decode
            }
            ReadOutcome::Malformed(_) => {
                self.stats.discarded += 1;
                EngineState::Idle
            }
            ReadOutcome::Pending | ReadOutcome::TimedOut => EngineState::Idle,
        }
    }

    fn decode(&mut self) -> EngineState {
        let Some(request) = &self.request else {
            return EngineState::Idle;
        };
        let kind = match request.kind {
            PacketKind::Register(k) if k.is_request() => k,
            other => {
                tracing::warn!(
                    src = %request.src,
                    kind = ?other,
                    "discarding packet that is not a register request"
                );
                self.stats.discarded += 1;
                self.request = None;
                return EngineState::Idle;
            }
        };
        self.stats.requests += 1;
        match RegisterTransaction::parse(kind, &request.payload) {
            Ok(txn) => {
                self.txn = Some(txn);
                EngineState::Dispatch
            }
            Err(e) => {
                tracing::debug!(src = %request.src, error = %e, "malformed register request");
                // The request subclass alone decides the error reply.
                let width = match kind {
                    RegKind::ReadRequest(w) | RegKind::WriteRequest(w) => w,
                    _ => RegWidth::W16,
                };
                let address = request.payload.first().copied().unwrap_or(0);
                self.txn = Some(match kind {
                    RegKind::WriteRequest(_) => RegisterTransaction::write(address, width, 0),
                    _ => RegisterTransaction::read(address, width),
                });
                self.outcome = Some(Err(Refusal::Malformed));
                EngineState::Respond
            }
        }
    }

    fn dispatch(&mut self) -> EngineState {
        let Some(txn) = self.txn else {
            return EngineState::Idle;
        };
        if txn.width > self.config.max_reg_width {
            self.outcome = Some(Err(Refusal::WidthExceedsMax(txn.width)));
            return EngineState::Respond;
        }
        if txn.address < self.config.backend_boundary {
            if txn.width != RegWidth::W16 {
                self.outcome = Some(Err(Refusal::InternalTooWide(txn.width)));
                return EngineState::Respond;
            }
            self.target = Target::Internal;
        } else {
            self.target = Target::Backend;
            self.backend.begin(&txn);
        }
        EngineState::AwaitBackend
    }

    fn await_backend(&mut self) -> EngineState {
        let Some(txn) = self.txn else {
            return EngineState::Idle;
        };
        let result = match self.target {
            Target::Internal => self.regs.access(&txn),
            Target::Backend => match self.backend.poll(&txn) {
                Poll::Ready(r) => r,
                Poll::Pending => return EngineState::AwaitBackend,
            },
        };
        self.outcome = Some(result.map_err(Refusal::Backend));
        EngineState::Respond
    }

    fn respond(&mut self, output: &mut dyn FlitSink) -> EngineState {
        if let (Some(request), Some(txn), Some(outcome)) =
            (self.request.take(), self.txn.take(), self.outcome.take())
        {
            let response = match outcome {
                Ok(value) => txn.success_response(&request, value),
                Err(refusal) => {
                    self.stats.errors += 1;
                    tracing::debug!(
                        src = %request.src,
                        address = txn.address,
                        width = %txn.width,
                        ?refusal,
                        "register request refused"
                    );
                    txn.error_response(&request)
                }
            };
            self.writer.enqueue(&response);
        }
        self.writer.tick(output);
        if self.writer.is_idle() {
            EngineState::Idle
        } else {
            EngineState::Respond
        }
    }
}
