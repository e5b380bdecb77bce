//! dinet-ctl: command-line host for a debug subnet reachable over UDP.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use dinet_core::config::DinetConfig;
use dinet_core::reg::scm;
use dinet_core::{DiAddr, ModuleType, RegWidth};
use dinet_host::directory::{find_by_type, snapshot};
use dinet_host::{HostSession, SessionConfig, UdpTransport, SCM_ADDRESS};

// ── Options ───────────────────────────────────────────────────────────────────

struct Options {
    target: String,
    bind: String,
    width: RegWidth,
    count: Option<usize>,
    json: bool,
    cpu: bool,
}

/// Decimal, or hex with a `0x` prefix.
fn parse_u128(text: &str) -> Result<u128> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("not a number: {text}"))
}

fn parse_u16(text: &str) -> Result<u16> {
    u16::try_from(parse_u128(text)?).with_context(|| format!("{text} does not fit 16 bits"))
}

fn parse_module(text: &str) -> Result<DiAddr> {
    DiAddr::new(parse_u16(text)?).with_context(|| format!("invalid module address {text}"))
}

// ── Session ───────────────────────────────────────────────────────────────────

async fn open(opts: &Options, config: &DinetConfig) -> Result<HostSession<UdpTransport>> {
    let transport = UdpTransport::connect(opts.bind.as_str(), opts.target.as_str())
        .await
        .with_context(|| format!("failed to reach target at {}", opts.target))?;
    let session = HostSession::new(transport, SessionConfig::from(config));
    let report = session
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}: is dinetd running?", opts.target))?;
    if !report.is_complete() {
        eprintln!(
            "warning: {} module(s) did not describe themselves",
            report.undescribed.len()
        );
    }
    Ok(session)
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct ModulesResponse {
    max_packet_len: usize,
    modules: Vec<dinet_host::ModuleDescriptor>,
}

async fn cmd_modules(session: &HostSession<UdpTransport>, opts: &Options) -> Result<()> {
    let modules = snapshot(session.directory());
    if opts.json {
        let resp = ModulesResponse {
            max_packet_len: session.max_packet_len(),
            modules,
        };
        println!("{}", serde_json::to_string_pretty(&resp)?);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Debug Modules ({})", modules.len());
    println!("═══════════════════════════════════════");
    println!("  Max packet length : {} words", session.max_packet_len());
    for m in &modules {
        let marker = if m.described { "" } else { "  (no answer)" };
        println!(
            "  {}  {:<6} {}{}",
            m.address,
            m.identity.module_type.short_name(),
            m.identity,
            marker
        );
    }
    Ok(())
}

async fn cmd_read(
    session: &HostSession<UdpTransport>,
    opts: &Options,
    module: &str,
    address: &str,
) -> Result<()> {
    let module = parse_module(module)?;
    let address = parse_u16(address)?;
    let value = session.register_read(module, opts.width, address).await?;
    let digits = opts.width.bits() as usize / 4;
    println!("{module} [0x{address:04x}] = 0x{value:0digits$x}");
    Ok(())
}

async fn cmd_write(
    session: &HostSession<UdpTransport>,
    opts: &Options,
    module: &str,
    address: &str,
    value: &str,
) -> Result<()> {
    let module = parse_module(module)?;
    let address = parse_u16(address)?;
    let value = parse_u128(value)?;
    session
        .register_write(module, opts.width, address, value)
        .await?;
    println!("{module} [0x{address:04x}] <- 0x{value:x}");
    Ok(())
}

async fn cmd_events(
    session: &HostSession<UdpTransport>,
    opts: &Options,
    modules: &[&str],
) -> Result<()> {
    let modules: Vec<DiAddr> = if modules.is_empty() {
        find_by_type(session.directory(), ModuleType::Stm)
    } else {
        modules.iter().map(|m| parse_module(m)).collect::<Result<_>>()?
    };
    if modules.is_empty() {
        bail!("no modules to listen to");
    }

    for &m in &modules {
        session.set_event_destination(m).await?;
        session.set_event_active(m, true).await?;
    }
    eprintln!("listening for events from {} module(s); ctrl-c to stop", modules.len());

    let mut received = 0;
    loop {
        if opts.count.is_some_and(|n| received >= n) {
            break;
        }
        let event = tokio::select! {
            r = session.event_receive() => r?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let words: Vec<String> = event.payload.iter().map(|w| format!("{w:04x}")).collect();
        println!("{} {}", event.src, words.join(" "));
        received += 1;
    }

    for &m in &modules {
        if let Err(e) = session.set_event_active(m, false).await {
            eprintln!("warning: could not stop {m}: {e}");
        }
    }
    Ok(())
}

async fn cmd_send_event(
    session: &HostSession<UdpTransport>,
    module: &str,
    words: &[&str],
) -> Result<()> {
    let module = parse_module(module)?;
    let payload = words.iter().map(|w| parse_u16(w)).collect::<Result<Vec<u16>>>()?;
    let packets = session.event_send_payload(module, &payload).await?;
    println!("Sent {} word(s) to {module} in {packets} packet(s).", payload.len());
    Ok(())
}

async fn cmd_reset(session: &HostSession<UdpTransport>, opts: &Options) -> Result<()> {
    let bit = if opts.cpu { scm::SYSRST_CPU } else { scm::SYSRST_SYS };
    session
        .register_write(SCM_ADDRESS, RegWidth::W16, scm::SYSRST, u128::from(bit))
        .await?;
    session
        .register_write(SCM_ADDRESS, RegWidth::W16, scm::SYSRST, 0)
        .await?;
    println!("{} reset pulsed.", if opts.cpu { "CPU" } else { "System" });
    Ok(())
}

fn print_usage() {
    println!("Usage: dinet-ctl [options] <command>");
    println!();
    println!("Commands:");
    println!("  modules                            List discovered debug modules");
    println!("  read <module> <address>            Read a register");
    println!("  write <module> <address> <value>   Write a register");
    println!("  events [<module>...]               Print events (default: every STM)");
    println!("  send-event <module> <word>...      Send an event to a module");
    println!("  reset                              Pulse the system reset");
    println!();
    println!("Options:");
    println!("  --target <addr>   dinetd address (default: from config)");
    println!("  --bind <addr>     Local UDP address (default: 0.0.0.0:0)");
    println!("  --width <bits>    Register width: 16, 32, 64 or 128 (default: 16)");
    println!("  --count <n>       Stop after n events");
    println!("  --json            Machine-readable module list");
    println!("  --cpu             Reset the CPUs only");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = DinetConfig::load().unwrap_or_default();

    let mut opts = Options {
        target: config.network.target.clone(),
        bind: "0.0.0.0:0".to_string(),
        width: RegWidth::W16,
        count: None,
        json: false,
        cpu: false,
    };
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--target" => {
                i += 1;
                opts.target = args.get(i).context("--target requires a value")?.clone();
            }
            "--bind" => {
                i += 1;
                opts.bind = args.get(i).context("--bind requires a value")?.clone();
            }
            "--width" => {
                i += 1;
                let bits: u32 = args
                    .get(i)
                    .context("--width requires a value")?
                    .parse()
                    .context("--width must be a number")?;
                opts.width = RegWidth::from_bits(bits).context("--width must be 16, 32, 64 or 128")?;
            }
            "--count" => {
                i += 1;
                opts.count = Some(
                    args.get(i)
                        .context("--count requires a value")?
                        .parse()
                        .context("--count must be a number")?,
                );
            }
            "--json" => opts.json = true,
            "--cpu" => opts.cpu = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    if matches!(remaining.as_slice(), ["help"] | ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }

    let session = open(&opts, &config).await?;
    let result = match remaining.as_slice() {
        ["modules"] | []                      => cmd_modules(&session, &opts).await,
        ["read", module, address]             => cmd_read(&session, &opts, module, address).await,
        ["write", module, address, value]     => cmd_write(&session, &opts, module, address, value).await,
        ["events", modules @ ..]              => cmd_events(&session, &opts, modules).await,
        ["send-event", module, words @ ..]    => cmd_send_event(&session, module, words).await,
        ["reset"]                             => cmd_reset(&session, &opts).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };
    session.disconnect().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_u128("0x200").unwrap(), 0x200);
        assert_eq!(parse_u128("17").unwrap(), 17);
        assert!(parse_u16("0x10000").is_err());
        assert_eq!(parse_module("0x3ff").unwrap().raw(), 0x3ff);
        assert!(parse_module("1024").is_err());
    }
}
