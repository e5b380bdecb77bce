//! A simulated debug target: a [`Subnet`] stepped by a tokio task and
//! reached through a [`ChannelTransport`].
//!
//! The driver sleeps while the subnet is quiet and steps it in bursts
//! while anything is in flight.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use dinet_core::{DiAddr, Flit, ModuleIdentity};
use dinet_fabric::endpoint::{PacketReader, ReadOutcome};
use dinet_fabric::link::transfer;
use dinet_fabric::subnet::SubnetStats;
use dinet_fabric::{FabricError, Subnet};

use crate::transport::{ChannelTransport, Transport};

/// Steps run between checks for new input.
const BURST_STEPS: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub subnet: SubnetStats,
    pub packets_in: u64,
    pub packets_out: u64,
    /// Host packets refused for exceeding the link's packet length.
    pub packets_refused: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleState {
    pub address: DiAddr,
    pub identity: ModuleIdentity,
    pub active: bool,
}

enum Control {
    Emit {
        module: DiAddr,
        payload: Vec<u16>,
        reply: oneshot::Sender<Result<usize, FabricError>>,
    },
    Stats(oneshot::Sender<TargetStats>),
    Modules(oneshot::Sender<Vec<ModuleState>>),
}

/// Handle to a running simulated target.
pub struct SimulatedTarget {
    control: mpsc::Sender<Control>,
    shutdown: broadcast::Sender<()>,
    driver: JoinHandle<()>,
}

impl SimulatedTarget {
    /// Start stepping `subnet`, exchanging packets over `transport`.
    /// A zero `step_interval` runs the subnet as fast as the runtime allows.
    pub fn spawn(subnet: Subnet, transport: ChannelTransport, step_interval: Duration) -> Self {
        let (control, control_rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let driver = TargetDriver {
            subnet,
            transport,
            pending: VecDeque::new(),
            reader: PacketReader::new(),
            control: control_rx,
            shutdown: shutdown_rx,
            step_interval,
            packets_in: 0,
            packets_out: 0,
            packets_refused: 0,
        };
        tracing::info!(?step_interval, "simulated target started");
        Self {
            control,
            shutdown,
            driver: tokio::spawn(driver.run()),
        }
    }

    /// Have `module` emit an event carrying `payload`.
    pub async fn emit_event(&self, module: DiAddr, payload: Vec<u16>) -> Result<usize, SimError> {
        let (reply, rx) = oneshot::channel();
        self.request(Control::Emit { module, payload, reply }).await?;
        Ok(rx.await.map_err(|_| SimError::Stopped)??)
    }

    pub async fn stats(&self) -> Result<TargetStats, SimError> {
        let (reply, rx) = oneshot::channel();
        self.request(Control::Stats(reply)).await?;
        rx.await.map_err(|_| SimError::Stopped)
    }

    /// Address, identity and activity of every module.
    pub async fn modules(&self) -> Result<Vec<ModuleState>, SimError> {
        let (reply, rx) = oneshot::channel();
        self.request(Control::Modules(reply)).await?;
        rx.await.map_err(|_| SimError::Stopped)
    }

    async fn request(&self, control: Control) -> Result<(), SimError> {
        self.control.send(control).await.map_err(|_| SimError::Stopped)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.driver.await {
            tracing::warn!(error = %e, "target driver ended abnormally");
        }
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

struct TargetDriver {
    subnet: Subnet,
    transport: ChannelTransport,
    pending: VecDeque<Flit>,
    reader: PacketReader,
    control: mpsc::Receiver<Control>,
    shutdown: broadcast::Receiver<()>,
    step_interval: Duration,
    packets_in: u64,
    packets_out: u64,
    packets_refused: u64,
}

impl TargetDriver {
    async fn run(mut self) {
        loop {
            if self.is_quiet() {
                tokio::select! {
                    _ = self.shutdown.recv() => break,
                    control = self.control.recv() => match control {
                        Some(c) => self.handle(c),
                        None => break,
                    },
                    result = self.transport.recv() => match result {
                        Ok(packet) => self.accept(packet),
                        Err(_) => {
                            tracing::info!("host side closed");
                            break;
                        }
                    },
                }
                continue;
            }

            if !self.burst().await {
                break;
            }

            loop {
                match self.transport.try_recv() {
                    Ok(Some(packet)) => self.accept(packet),
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
            while let Ok(c) = self.control.try_recv() {
                self.handle(c);
            }
            if self.shutdown.try_recv().is_ok() {
                break;
            }
            if self.step_interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.step_interval).await;
            }
        }
        tracing::info!(steps = self.subnet.stats().steps, "simulated target stopped");
    }

    fn is_quiet(&self) -> bool {
        self.pending.is_empty() && !self.reader.in_packet() && self.subnet.is_idle()
    }

    fn accept(&mut self, packet: dinet_core::Packet) {
        if let Err(e) = packet.check_len(self.subnet.max_packet_len()) {
            self.packets_refused += 1;
            tracing::warn!(error = %e, dest = %packet.dest, "refusing host packet");
            return;
        }
        tracing::trace!(%packet, "into subnet");
        self.packets_in += 1;
        self.pending.extend(packet.to_flits());
    }

    /// Step until quiet or the burst is spent. False once the host is gone.
    async fn burst(&mut self) -> bool {
        for _ in 0..BURST_STEPS {
            transfer(&mut self.pending, self.subnet.host_ingress_mut());
            self.subnet.step();
            match self.reader.tick(self.subnet.host_egress_mut()) {
                ReadOutcome::Packet(packet) => {
                    tracing::trace!(%packet, "out of subnet");
                    self.packets_out += 1;
                    if self.transport.send(packet).await.is_err() {
                        tracing::info!("host side closed");
                        return false;
                    }
                }
                ReadOutcome::Pending | ReadOutcome::TimedOut | ReadOutcome::Malformed(_) => {}
            }
            if self.is_quiet() {
                break;
            }
        }
        true
    }

    fn handle(&mut self, control: Control) {
        match control {
            Control::Emit { module, payload, reply } => {
                let result = self
                    .subnet
                    .module_mut(module)
                    .and_then(|m| m.emit_event(&payload));
                let _ = reply.send(result);
            }
            Control::Stats(reply) => {
                let _ = reply.send(TargetStats {
                    subnet: self.subnet.stats(),
                    packets_in: self.packets_in,
                    packets_out: self.packets_out,
                    packets_refused: self.packets_refused,
                });
            }
            Control::Modules(reply) => {
                let modules = (0..self.subnet.module_count() as u16)
                    .filter_map(|raw| self.subnet.module(DiAddr::from_word(raw)))
                    .map(|m| ModuleState {
                        address: m.address(),
                        identity: m.identity(),
                        active: m.is_active(),
                    })
                    .collect();
                let _ = reply.send(modules);
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("simulated target has stopped")]
    Stopped,

    #[error(transparent)]
    Fabric(#[from] FabricError),
}
