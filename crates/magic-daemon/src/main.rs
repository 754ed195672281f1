//! MAGIC daemon.
//!
//! Loads the daemon configuration and per-link profiles, builds the engine
//! over the selected host backend, hosts one simulated driver per link, and
//! serves the framed control protocol over TCP until interrupted.

mod server;
mod sim;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use magic_common::adif;
use magic_common::config::{DaemonConfig, Ini, LinkProfile};
use magic_engine::conntrack::{MemoryConntrack, NetfilterConntrack};
use magic_engine::host::{HostBackend, MemoryHost, NativeHost, ShellHost};
use magic_engine::{Engine, EngineConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// MAGIC link management daemon.
#[derive(Parser, Debug)]
#[command(name = "magicd", about = "MAGIC multi-link routing and session control daemon")]
struct Cli {
    /// Daemon configuration file (INI).
    config: PathBuf,

    /// Per-link driver profile (INI); repeatable.
    #[arg(long = "link-config")]
    link_configs: Vec<PathBuf>,

    /// Listen address override.
    #[arg(long)]
    listen: Option<String>,

    /// Host backend: "native" (netlink), "shell" (iproute2/iptables
    /// subprocesses), or "none" (in-memory, no host mutation).
    #[arg(long, default_value = "auto")]
    host_backend: String,

    /// Initial flight phase hint (e.g. GATE, CRUISE).
    #[arg(long)]
    flight_phase: Option<String>,

    /// Aircraft-data publish XML applied at startup as the phase hint.
    #[arg(long)]
    adif_publish: Option<PathBuf>,

    /// Scripted outage for a hosted link: `<link_name>:<delay_sec>`.
    /// The driver announces GoingDown after the delay, then Down after its
    /// configured lead time. Repeatable; testing aid.
    #[arg(long = "simulate-outage")]
    simulate_outages: Vec<String>,
}

fn select_backend(choice: &str) -> Result<Box<dyn HostBackend>> {
    match choice {
        "native" => Ok(Box::new(NativeHost::new())),
        "shell" => Ok(Box::new(ShellHost::new())),
        "none" => Ok(Box::new(MemoryHost::new())),
        "auto" => {
            // Routing netlink needs CAP_NET_ADMIN; without it the shell
            // tools at least produce readable permission errors.
            let root = unsafe { libc::geteuid() } == 0;
            if root {
                Ok(Box::new(NativeHost::new()))
            } else {
                warn!("not running as root, using the subprocess host backend");
                Ok(Box::new(ShellHost::new()))
            }
        }
        other => anyhow::bail!("unknown host backend {other:?}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let ini = Ini::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let mut config = DaemonConfig::from_ini(&ini);
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    info!(
        name = %config.name,
        listen = %config.listen_addr,
        ingress = %config.ingress_interface,
        "magicd starting"
    );

    let backend = select_backend(&cli.host_backend)?;
    let conntrack: Box<dyn magic_engine::conntrack::ConntrackReader> =
        if cli.host_backend == "none" {
            Box::new(MemoryConntrack::new())
        } else {
            Box::new(NetfilterConntrack::new())
        };

    let engine = Engine::new(
        backend,
        conntrack,
        EngineConfig {
            ingress_iface: config.ingress_interface.clone(),
            ingress_ip: config.ingress_ip,
            stats_cache_ttl: std::time::Duration::from_secs(config.stats_cache_ttl_sec),
        },
    )?;
    let engine = Arc::new(engine);

    if let Some(raw) = cli.flight_phase {
        match raw.parse() {
            Ok(phase) => engine.set_flight_phase(phase),
            Err(e) => warn!(error = %e, "ignoring --flight-phase"),
        }
    }
    if let Some(path) = cli.adif_publish {
        let xml = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let state = adif::parse_publish(&xml);
        info!(phase = state.flight_phase.as_str(), "applying aircraft-data hint");
        engine.set_flight_phase(state.flight_phase);
    }

    let mut drivers = Vec::new();
    for path in &cli.link_configs {
        let ini = Ini::load(path).with_context(|| format!("loading {}", path.display()))?;
        let profile = LinkProfile::from_ini(&ini)
            .with_context(|| format!("link profile {}", path.display()))?;
        let name = profile.link_name.clone();
        let driver = sim::SimLinkDriver::new(profile);
        match engine.register_link(driver.clone()) {
            Ok(id) => {
                info!(link = %name, id = %id, "link driver hosted");
                drivers.push((name, driver));
            }
            Err(e) => warn!(link = %name, error = %e, "link registration failed"),
        }
    }

    for spec in &cli.simulate_outages {
        let Some((name, delay)) = spec.split_once(':') else {
            warn!(spec = %spec, "ignoring malformed --simulate-outage (want name:secs)");
            continue;
        };
        let Ok(delay) = delay.parse::<u64>() else {
            warn!(spec = %spec, "ignoring --simulate-outage with bad delay");
            continue;
        };
        let Some((_, driver)) = drivers.iter().find(|(n, _)| n == name) else {
            warn!(spec = %spec, "ignoring --simulate-outage for unknown link");
            continue;
        };
        let driver = driver.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(delay));
            driver.trigger_going_down();
        });
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, shutting down");
            stop.store(true, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    let listener =
        TcpListener::bind(&config.listen_addr).with_context(|| config.listen_addr.clone())?;
    let control = server::Server::new(config.name.clone(), engine.clone());
    control.run(listener, config.worker_threads, stop)?;

    match Arc::try_unwrap(engine) {
        Ok(mut engine) => engine.shutdown(),
        Err(engine) => {
            warn!("engine still shared at exit, releasing sessions anyway");
            for id in engine.session_ids() {
                let _ = engine.release(id);
            }
        }
    }
    info!("magicd stopped");
    Ok(())
}
