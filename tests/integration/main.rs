//! dinet integration test harness.
//!
//! Every test runs a host session against a simulated subnet in the same
//! process, either over an in-memory channel or over UDP on loopback.
//! The default target is the SCM at 0x000, a MAM at 0x001 (cannot stall)
//! and an STM at 0x002 (starts stalled).

use std::time::Duration;

use anyhow::{Context, Result};

use dinet_core::config::DinetConfig;
use dinet_core::DiAddr;
use dinet_fabric::Subnet;
use dinet_host::{
    ChannelTransport, DiscoveryReport, HostSession, SessionConfig, SimulatedTarget,
};

mod events;
mod failures;
mod registers;
mod udp;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SCM: DiAddr = DiAddr::from_word(0);
pub const MAM: DiAddr = DiAddr::from_word(1);
pub const STM: DiAddr = DiAddr::from_word(2);

/// A connected session and the target behind it.
pub struct Rig {
    pub session: HostSession<ChannelTransport>,
    pub target: SimulatedTarget,
    pub report: DiscoveryReport,
}

impl Rig {
    pub async fn shutdown(self) {
        self.session.disconnect().await;
        self.target.shutdown().await;
    }
}

pub fn session_config(config: &DinetConfig) -> SessionConfig {
    SessionConfig {
        register_timeout: Duration::from_millis(500),
        ..SessionConfig::from(config)
    }
}

/// Spawn a simulated target for `config` and connect a session to it.
pub async fn rig_with(config: &DinetConfig) -> Result<Rig> {
    let subnet = Subnet::new(&config.link, &config.target).context("subnet")?;
    let (host, device) = ChannelTransport::pair(64);
    let target = SimulatedTarget::spawn(subnet, device, Duration::ZERO);
    let session = HostSession::new(host, session_config(config));
    let report = session.connect().await.context("connect")?;
    Ok(Rig {
        session,
        target,
        report,
    })
}

pub async fn rig() -> Result<Rig> {
    rig_with(&DinetConfig::default()).await
}

/// Route the STM's events to the host and start it.
pub async fn start_stm(rig: &Rig) -> Result<()> {
    rig.session.set_event_destination(STM).await?;
    rig.session.set_event_active(STM, true).await?;
    Ok(())
}
