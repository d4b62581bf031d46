//! csendd — LAN chat daemon.

use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use csend_core::config::{CsendConfig, Scheduler};
use csend_core::Identity;

mod cooperative;
mod logging;
mod shell;
mod tcp;
mod threaded;
mod udp;

use logging::LogControl;
use shell::{parse_command, Command, HELP};

/// Runtime settings resolved from config and the host.
#[derive(Debug, Clone)]
pub struct Settings {
    pub identity: Identity,
    pub discovery_port: u16,
    pub messaging_port: u16,
    pub broadcast: SocketAddr,
    pub discovery_interval: Duration,
    pub peer_capacity: usize,
    pub peer_timeout: Duration,
    pub tick_interval: Duration,
    pub pooled: bool,
}

impl Settings {
    fn from_config(config: &CsendConfig) -> Result<Self> {
        let address = match config.local_address()? {
            Some(addr) => addr,
            None => udp::probe_local_address().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "could not determine local address, using loopback");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }),
        };
        let identity =
            Identity::new(config.identity.username.clone(), address).context("invalid identity")?;
        let broadcast_ip: IpAddr = config
            .network
            .broadcast_address
            .parse()
            .context("invalid broadcast address")?;

        Ok(Self {
            identity,
            discovery_port: config.network.discovery_port,
            messaging_port: config.network.messaging_port,
            broadcast: SocketAddr::new(broadcast_ip, config.network.discovery_port),
            discovery_interval: Duration::from_secs(csend_core::wire::DISCOVERY_INTERVAL_SECS),
            peer_capacity: config.peers.capacity,
            peer_timeout: Duration::from_secs(config.peers.timeout_secs),
            tick_interval: Duration::from_millis(config.runtime.tick_interval_ms),
            pooled: config.runtime.pooled,
        })
    }
}

/// Read console lines on a plain thread; a blocked stdin read must not
/// hold up runtime shutdown. `/debug` is served here, the rest is
/// forwarded to the scheduler.
fn spawn_console(commands: mpsc::UnboundedSender<Command>, mut log: LogControl) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(Command::Debug) => {
                    log.toggle_debug();
                }
                Ok(cmd) => {
                    let quit = cmd == Command::Quit;
                    if commands.send(cmd).is_err() || quit {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, help = HELP, "bad command"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let log = logging::init();

    // Load config
    if let Err(e) = CsendConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CsendConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CsendConfig::default()
    });

    let settings = Settings::from_config(&config)?;
    tracing::info!(
        user = %settings.identity.username,
        addr = %settings.identity.address,
        discovery_port = settings.discovery_port,
        messaging_port = settings.messaging_port,
        "csendd starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    spawn_console(command_tx, log);
    tracing::info!(commands = HELP, "console ready");

    match config.runtime.scheduler {
        Scheduler::Threaded => threaded::run(settings, command_rx, shutdown_tx).await?,
        Scheduler::Cooperative => {
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::task::spawn_blocking(move || {
                cooperative::run(settings, command_rx, shutdown_rx, shutdown_tx)
            })
            .await
            .context("cooperative driver panicked")??;
        }
    }

    tracing::info!("csendd stopped");
    Ok(())
}
