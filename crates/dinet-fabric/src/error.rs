use dinet_core::DiAddr;

use crate::event::FragmentError;

/// Errors raised while building or driving the fabric model.
///
/// Protocol errors never show up here; those are answered on the wire.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("buffer depth must be at least one flit")]
    ZeroDepth,

    #[error("buffer depth {depth} cannot hold a packet of {max_packet_len} words")]
    BufferTooShallow { depth: usize, max_packet_len: usize },

    #[error("max packet length {0} leaves no room for a payload")]
    PacketLimitTooSmall(usize),

    #[error("no module at address {0}")]
    UnknownModule(DiAddr),

    #[error("module {0} is not active; set bit 0 of its control register first")]
    ModuleInactive(DiAddr),

    #[error("{modules} modules configured but {backends} backends supplied")]
    BackendCount { modules: usize, backends: usize },

    #[error("subnet of {0} modules does not fit the address space")]
    TooManyModules(usize),

    #[error(transparent)]
    Fragment(#[from] FragmentError),
}
