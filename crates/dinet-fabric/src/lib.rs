//! dinet-fabric: a lock-step model of the on-chip side of the debug
//! interconnect.
//!
//! Components advance one step at a time through `tick`. They are wired
//! through [`link::FlitSource`] and [`link::FlitSink`] ports and never reach
//! into each other's storage.

pub mod arbiter;
pub mod backend;
pub mod buffer;
pub mod demux;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod link;
pub mod module;
pub mod regaccess;
pub mod subnet;

pub use backend::{BackendFault, DynBackend, MapBackend, RegisterBackend, ScmBackend};
pub use buffer::{Admission, ElasticBuffer, Watermarks};
pub use demux::{Demux, Route};
pub use error::FabricError;
pub use event::{fragment, Event, FragmentError, Reassembler};
pub use link::{FlitSink, FlitSource, Link};
pub use module::DebugModule;
pub use regaccess::{EngineConfig, EngineState, RegAccessEngine};
pub use subnet::Subnet;
