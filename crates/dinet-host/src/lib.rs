//! dinet-host: the host side of the debug interconnect.
//!
//! A [`HostSession`] talks to a target over any [`Transport`]. The target
//! may be real hardware behind UDP or a [`SimulatedTarget`] in the same
//! process.

pub mod directory;
pub mod session;
pub mod sim;
pub mod transport;

pub use directory::{ModuleDescriptor, ModuleDirectory};
pub use session::{DiscoveryReport, EventHandler, HostSession, SessionConfig, SessionError, SCM_ADDRESS};
pub use sim::{ModuleState, SimError, SimulatedTarget, TargetStats};
pub use transport::{ChannelTransport, Transport, TransportError, UdpTransport};
