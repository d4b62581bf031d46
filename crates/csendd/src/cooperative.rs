//! Cooperative model: one blocking thread ticks a [`Node`] and polls the
//! console channel between ticks.

use std::time::Instant;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use csend_services::{
    ConnectionMachine, ConnectionPool, DatagramTransport, MessagingEngine, Node, NodeOptions,
    SendError, Timings,
};

use crate::shell::{log_matching_peers, log_peers, Command, LogShell, HELP, SNAPSHOT_INTERVAL};
use crate::tcp::{PooledTcpDriver, TcpDriver};
use crate::udp::UdpDriver;
use crate::Settings;

/// Run until `/quit` or the shutdown signal. Blocks the calling thread.
pub fn run(
    settings: Settings,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let datagrams = UdpDriver::bind(settings.discovery_port)?;
    let options = NodeOptions {
        peer_capacity: settings.peer_capacity,
        peer_timeout: settings.peer_timeout,
        discovery_interval: settings.discovery_interval,
        broadcast: settings.broadcast,
        ..NodeOptions::default()
    };
    let identity = settings.identity.clone();
    let port = settings.messaging_port;
    let channels = (commands, shutdown_rx, shutdown_tx);

    if settings.pooled {
        tracing::info!("cooperative scheduler, pooled connections");
        let pool = ConnectionPool::new(PooledTcpDriver, identity.clone(), port, Timings::default());
        drive(Node::new(identity, options, datagrams, pool), &settings, channels)
    } else {
        tracing::info!("cooperative scheduler, single connection slot");
        let machine = ConnectionMachine::new(TcpDriver, identity.clone(), port, Timings::default());
        drive(Node::new(identity, options, datagrams, machine), &settings, channels)
    }
}

type Channels = (
    mpsc::UnboundedReceiver<Command>,
    broadcast::Receiver<()>,
    broadcast::Sender<()>,
);

fn drive<D: DatagramTransport, M: MessagingEngine>(
    mut node: Node<D, M>,
    settings: &Settings,
    (mut commands, mut shutdown_rx, shutdown_tx): Channels,
) -> Result<()> {
    let mut shell = LogShell;
    let mut last_snapshot = Instant::now();

    loop {
        match shutdown_rx.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => break,
        }

        let now = Instant::now();
        node.tick(now);
        node.deliver(&mut shell);

        match commands.try_recv() {
            Ok(Command::Quit) => {
                let _ = shutdown_tx.send(());
                break;
            }
            Ok(cmd) => handle(&mut node, cmd, now),
            Err(mpsc::error::TryRecvError::Empty) => {}
            // Console gone; keep ticking until a signal arrives.
            Err(mpsc::error::TryRecvError::Disconnected) => {}
        }

        if now.duration_since(last_snapshot) >= SNAPSHOT_INTERVAL {
            last_snapshot = now;
            let active = node.peers().list_active();
            tracing::info!(active = active.len(), "── peer snapshot ──");
            log_peers(&active);
        }

        std::thread::sleep(settings.tick_interval);
    }

    tracing::info!("shutting down");
    let results = node.shutdown();
    let delivered = results.iter().filter(|(_, r)| r.is_ok()).count();
    tracing::info!(delivered, total = results.len(), "quit notifications sent");
    Ok(())
}

fn handle<D: DatagramTransport, M: MessagingEngine>(
    node: &mut Node<D, M>,
    cmd: Command,
    now: Instant,
) {
    match cmd {
        Command::List { filter } => {
            let active = node.peers().list_active();
            tracing::info!(active = active.len(), "peers");
            log_matching_peers(&active, filter.as_deref());
        }
        Command::Status => tracing::info!(
            user = %node.identity().username,
            addr = %node.identity().address,
            active = node.peers().active_count(),
            "status"
        ),
        Command::Send { index, text } => match node.send_to_index(index, &text, now) {
            Ok(()) => tracing::info!(index, "message sent"),
            Err(SendError::Busy) => tracing::warn!(index, "connection busy, try again"),
            Err(e) => tracing::warn!(index, error = %e, "send failed"),
        },
        Command::Broadcast { text } => {
            let results = node.broadcast_text(&text, now);
            let delivered = results.iter().filter(|(_, r)| r.is_ok()).count();
            tracing::info!(delivered, total = results.len(), "broadcast sent");
        }
        Command::Help => tracing::info!(commands = HELP, "help"),
        Command::Debug | Command::Quit => {}
    }
}
