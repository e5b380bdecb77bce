//! dinet-core: wire format, register map, and module identity shared by
//! every other dinet crate.

pub mod config;
pub mod module;
pub mod reg;
pub mod wire;

pub use module::{ModuleIdentity, ModuleType, ModuleVendor};
pub use reg::{RegOp, RegWidth, RegisterTransaction};
pub use wire::{DiAddr, EventKind, Flit, Packet, PacketClass, PacketKind, RegKind, Subtype, WireError};
