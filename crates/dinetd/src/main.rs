//! dinetd: serves a simulated debug subnet over UDP.
//!
//! Each datagram carries one packet. Responses and events go back to the
//! address the most recent datagram came from.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

use dinet_core::config::DinetConfig;
use dinet_core::{ModuleType, Packet};
use dinet_fabric::Subnet;
use dinet_host::{ChannelTransport, SimulatedTarget, Transport};

const MAX_DATAGRAM: usize = 4096;

struct Args {
    listen: Option<String>,
    trace_interval: Option<Duration>,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut parsed = Args {
        listen: None,
        trace_interval: None,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" => {
                i += 1;
                parsed.listen = Some(args.get(i).context("--listen requires an address")?.clone());
            }
            "--trace-interval-ms" => {
                i += 1;
                let ms: u64 = args
                    .get(i)
                    .context("--trace-interval-ms requires a value")?
                    .parse()
                    .context("--trace-interval-ms must be a number")?;
                parsed.trace_interval = Some(Duration::from_millis(ms.max(1)));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    Ok(parsed)
}

fn print_usage() {
    println!("Usage: dinetd [--listen <addr>] [--trace-interval-ms <ms>]");
    println!();
    println!("Options:");
    println!("  --listen <addr>           UDP address to serve on (default: from config)");
    println!("  --trace-interval-ms <ms>  Emit a trace event from every active STM this often");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;

    // Load config
    if let Err(e) = DinetConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DinetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DinetConfig::default()
    });
    let listen = args.listen.unwrap_or_else(|| config.network.listen.clone());

    // Target
    let subnet = Subnet::new(&config.link, &config.target).context("failed to build subnet")?;
    let (host_side, target_side) = ChannelTransport::pair(config.link.buffer_depth.max(16));
    let target = Arc::new(SimulatedTarget::spawn(
        subnet,
        target_side,
        Duration::from_micros(config.target.step_interval_us),
    ));
    let host_side = Arc::new(host_side);

    let socket = Arc::new(
        UdpSocket::bind(&listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?,
    );
    tracing::info!(addr = %socket.local_addr()?, "dinetd listening");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    let inbound_task = tokio::spawn(inbound_loop(
        socket.clone(),
        host_side.clone(),
        peer.clone(),
        config.link.max_packet_len,
        shutdown_tx.subscribe(),
    ));
    let outbound_task = tokio::spawn(outbound_loop(
        socket,
        host_side,
        peer,
        shutdown_tx.subscribe(),
    ));
    let trace_task = args.trace_interval.map(|every| {
        tokio::spawn(trace_loop(target.clone(), every, shutdown_tx.subscribe()))
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = inbound_task       => tracing::error!("inbound task exited: {:?}", r),
        r = outbound_task      => tracing::error!("outbound task exited: {:?}", r),
    }
    let _ = shutdown_tx.send(());

    if let Some(task) = trace_task {
        let _ = task.await;
    }
    match Arc::try_unwrap(target) {
        Ok(target) => target.shutdown().await,
        Err(_) => tracing::warn!("target still referenced; not waiting for it"),
    }
    Ok(())
}

/// Datagrams from the network into the target.
async fn inbound_loop(
    socket: Arc<UdpSocket>,
    target: Arc<ChannelTransport>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    max_packet_len: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            r = socket.recv_from(&mut buf) => {
                let (len, from) = match r {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp receive failed");
                        continue;
                    }
                };
                let data = &buf[..len];
                let packet = match Packet::from_bytes(data) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(%from, error = %e, data = %hex::encode(data), "dropping malformed datagram");
                        continue;
                    }
                };
                if let Err(e) = packet.check_len(max_packet_len) {
                    tracing::warn!(%from, error = %e, "dropping over-length packet");
                    continue;
                }
                {
                    let mut current = peer.lock().await;
                    if *current != Some(from) {
                        tracing::info!(%from, "host attached");
                        *current = Some(from);
                    }
                }
                tracing::debug!(%from, %packet, "from host");
                if target.send(packet).await.is_err() {
                    tracing::error!("target stopped");
                    return;
                }
            }
        }
    }
}

/// Packets from the target back to the last host seen.
async fn outbound_loop(
    socket: Arc<UdpSocket>,
    target: Arc<ChannelTransport>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            r = target.recv() => {
                let Ok(packet) = r else {
                    tracing::error!("target stopped");
                    return;
                };
                let Some(to) = *peer.lock().await else {
                    tracing::debug!(%packet, "no host attached; dropping");
                    continue;
                };
                tracing::debug!(%to, %packet, "to host");
                if let Err(e) = socket.send_to(&packet.to_bytes(), to).await {
                    tracing::warn!(%to, error = %e, "udp send failed");
                }
            }
        }
    }
}

/// Emit a numbered trace event from every active STM.
async fn trace_loop(target: Arc<SimulatedTarget>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(every);
    let mut seq: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }
        let Ok(modules) = target.modules().await else { return };
        for m in modules
            .iter()
            .filter(|m| m.active && m.identity.module_type == ModuleType::Stm)
        {
            let payload = vec![(seq >> 16) as u16, seq as u16, m.address.raw()];
            if let Err(e) = target.emit_event(m.address, payload).await {
                tracing::warn!(module = %m.address, error = %e, "trace event not emitted");
            }
        }
        seq = seq.wrapping_add(1);
    }
}
