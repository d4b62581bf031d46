//! Multi-threaded model: one tokio task per concern, sharing the peer
//! table behind a mutex that is held for one table operation at a time.

use std::net::{IpAddr, SocketAddr};
use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};

use csend_core::wire::{MessageType, MAX_FRAME_SIZE};
use csend_core::Identity;
use csend_services::{
    dispatch_frame, Dispatch, DiscoveryEngine, ErrorClass, EventQueue, NodeEvent, PeerTable,
    SendError, SharedPeerTable, ShellEvents, Timings, TransportError,
};

use crate::shell::{log_matching_peers, log_peers, Command, LogShell, HELP, SNAPSHOT_INTERVAL};
use crate::{tcp, udp, Settings};

fn lock(peers: &SharedPeerTable) -> Result<MutexGuard<'_, PeerTable>> {
    peers.lock().map_err(|_| anyhow!("peer table lock poisoned"))
}

fn deliver(events: Vec<NodeEvent>, peers: &SharedPeerTable, shell: &mut LogShell) -> Result<()> {
    for event in events {
        match event {
            NodeEvent::PeerListChanged => {
                let active = lock(peers)?.list_active();
                shell.on_peer_list_changed(&active);
            }
            NodeEvent::TextMessage { from, name, text } => {
                shell.on_text_message(from, &name, &text)
            }
        }
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

pub async fn run(
    settings: Settings,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let peers = PeerTable::shared(settings.peer_capacity);
    let timings = Timings::default();

    let udp = UdpSocket::from_std(
        udp::make_discovery_socket(settings.discovery_port)
            .context("failed to create discovery socket")?,
    )
    .context("failed to convert to tokio UdpSocket")?;
    let listener = TcpListener::from_std(
        tcp::listen_socket(settings.messaging_port).context("failed to bind messaging listener")?,
    )
    .context("failed to convert to tokio TcpListener")?;

    let engine = DiscoveryEngine::new(settings.identity.clone(), settings.broadcast)
        .with_interval(settings.discovery_interval);

    let discovery_task = tokio::spawn(discovery_loop(
        engine,
        udp,
        peers.clone(),
        shutdown_tx.subscribe(),
    ));
    let listener_task = tokio::spawn(listener_loop(
        listener,
        peers.clone(),
        timings.idle_receive_timeout,
        shutdown_tx.subscribe(),
    ));
    let expiry_task = tokio::spawn(expiry_loop(
        peers.clone(),
        settings.peer_timeout,
        shutdown_tx.subscribe(),
    ));
    let snapshot_task = tokio::spawn(snapshot_loop(peers.clone(), shutdown_tx.subscribe()));

    let sender = Sender {
        identity: settings.identity.clone(),
        port: settings.messaging_port,
        timings,
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            cmd = commands.recv() => match cmd {
                Some(Command::Quit) => {
                    let _ = shutdown_tx.send(());
                    break;
                }
                Some(cmd) => sender.handle(cmd, &peers).await?,
                // Console gone; keep serving until a signal arrives.
                None => {
                    let _ = shutdown_rx.recv().await;
                    break;
                }
            },
        }
    }

    tracing::info!("shutting down");
    sender.broadcast_quit(&peers).await?;

    for (name, task) in [
        ("discovery", discovery_task),
        ("listener", listener_task),
        ("expiry", expiry_task),
        ("snapshot", snapshot_task),
    ] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = name, error = %e, "task failed"),
            Err(e) => tracing::error!(task = name, error = %e, "task panicked"),
        }
    }
    Ok(())
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Broadcast when due and answer discovery datagrams until shutdown.
pub async fn discovery_loop(
    mut engine: DiscoveryEngine,
    socket: UdpSocket,
    peers: SharedPeerTable,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let discovery_frame = engine.discovery_frame()?;
    let response_frame = engine.response_frame()?;
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let mut check = tokio::time::interval(Duration::from_secs(1));
    let mut shell = LogShell;

    tracing::info!(
        dest = %engine.broadcast_addr(),
        interval_secs = engine.interval().as_secs(),
        "discovery starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("discovery shutting down");
                return Ok(());
            }

            _ = check.tick() => {
                let now = Instant::now();
                if engine.broadcast_due(now) {
                    match socket.send_to(&discovery_frame, engine.broadcast_addr()).await {
                        Ok(_) => {
                            engine.mark_broadcast(now);
                            tracing::trace!("discovery broadcast sent");
                        }
                        Err(e) => tracing::warn!(error = %e, "discovery broadcast failed"),
                    }
                }
            }

            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                };

                let outcome = {
                    let mut table = lock(&peers)?;
                    engine.handle_packet(&buf[..len], from, Instant::now(), &mut table)
                };

                if let Some(dest) = outcome.respond_to {
                    if let Err(e) = socket.send_to(&response_frame, dest).await {
                        tracing::warn!(peer = %dest, error = %e, "discovery response failed");
                    }
                }
                if outcome.peer_added {
                    let active = lock(&peers)?.list_active();
                    shell.on_peer_list_changed(&active);
                }
            }
        }
    }
}

// ── Inbound messages ──────────────────────────────────────────────────────────

/// Accept message connections, reading each in its own task.
pub async fn listener_loop(
    listener: TcpListener,
    peers: SharedPeerTable,
    idle_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "message listener starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("message listener shutting down");
                return Ok(());
            }

            result = listener.accept() => match result {
                Ok((stream, from)) => {
                    tracing::debug!(peer = %from, "inbound connection accepted");
                    let peers = peers.clone();
                    let shutdown = shutdown.resubscribe();
                    tokio::spawn(async move {
                        let handled =
                            handle_connection(stream, from, peers, idle_timeout, shutdown).await;
                        if let Err(e) = handled {
                            tracing::warn!(peer = %from, error = %e, "connection handler failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    from: SocketAddr,
    peers: SharedPeerTable,
    idle_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let mut shell = LogShell;

    loop {
        let read = tokio::select! {
            _ = shutdown.recv() => {
                SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
                return Ok(());
            }
            r = tokio::time::timeout(idle_timeout, stream.read(&mut buf)) => r,
        };

        let n = match read {
            Err(_) => {
                tracing::debug!(peer = %from, "inbound session idle, closing");
                SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
                return Ok(());
            }
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::warn!(peer = %from, error = %e, "receive failed");
                return Ok(());
            }
        };

        let mut events = EventQueue::new();
        let dispatch = {
            let mut table = lock(&peers)?;
            dispatch_frame(&buf[..n], from.ip(), Instant::now(), &mut table, &mut events)
        };
        events.flush_peer_change();
        deliver(events.drain(), &peers, &mut shell)?;

        if dispatch == Dispatch::Quit {
            return Ok(());
        }
    }
}

// ── Housekeeping ──────────────────────────────────────────────────────────────

/// Deactivate peers not seen within `timeout`.
pub async fn expiry_loop(
    peers: SharedPeerTable,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut shell = LogShell;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = interval.tick() => {
                let (expired, active) = {
                    let mut table = lock(&peers)?;
                    let expired = table.prune_expired(Instant::now(), timeout);
                    (expired, table.list_active())
                };
                if expired > 0 {
                    tracing::debug!(expired, "expired peer table entries");
                    shell.on_peer_list_changed(&active);
                }
            }
        }
    }
}

pub async fn snapshot_loop(
    peers: SharedPeerTable,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = interval.tick() => {
                let active = lock(&peers)?.list_active();
                tracing::info!(count = active.len(), "peer table snapshot");
                log_peers(&active);
            }
        }
    }
}

// ── Outbound messages ─────────────────────────────────────────────────────────

fn connect_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => TransportError::Refused,
        std::io::ErrorKind::AddrInUse => TransportError::Busy,
        _ => TransportError::Io(e),
    }
}

/// Sends run on the caller's task, one connection per message.
pub struct Sender {
    pub identity: Identity,
    pub port: u16,
    pub timings: Timings,
}

impl Sender {
    pub async fn send(
        &self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
    ) -> Result<(), SendError> {
        let frame = self.identity.frame(msg_type, payload)?;
        let addr = SocketAddr::new(to, self.port);

        let connect_timeout = self.timings.connect_timeout;
        let connecting = tokio::time::timeout(connect_timeout, TcpStream::connect(addr));
        let connected = match connecting.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(connect_error(e)),
            Err(_) => Err(TransportError::TimedOut),
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) if msg_type == MessageType::Quit && e.class() == ErrorClass::Transient => {
                tracing::debug!(
                    peer = %addr,
                    error = %e,
                    "quit hit an existing connection, treating as sent"
                );
                return Ok(());
            }
            Err(e) => return Err(SendError::Connect(e)),
        };

        let writing = tokio::time::timeout(self.timings.send_timeout, stream.write_all(&frame));
        let written = match writing.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Write(e.into())),
            Err(_) => Err(SendError::Write(TransportError::TimedOut)),
        };

        if written.is_ok() && msg_type != MessageType::Quit {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(peer = %addr, error = %e, "graceful close failed");
            }
        } else if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
            tracing::debug!(peer = %addr, error = %e, "abortive close failed");
        }

        if written.is_ok() {
            tracing::debug!(
                peer = %addr,
                msg_type = %msg_type,
                bytes = frame.len(),
                "message sent"
            );
        }
        written
    }

    async fn handle(&self, cmd: Command, peers: &SharedPeerTable) -> Result<()> {
        match cmd {
            Command::List { filter } => {
                let active = lock(peers)?.list_active();
                tracing::info!(count = active.len(), "active peers");
                log_matching_peers(&active, filter.as_deref());
            }
            Command::Status => {
                let active = lock(peers)?.active_count();
                tracing::info!(
                    user = %self.identity.username,
                    addr = %self.identity.address,
                    active,
                    "status"
                );
            }
            Command::Help => tracing::info!(commands = HELP, "help"),
            Command::Send { index, text } => {
                let target = lock(peers)?.get_by_index(index);
                let result = match target {
                    Some(peer) => self.send(peer.address, MessageType::Text, &text).await,
                    None => Err(SendError::UnknownPeerIndex(index)),
                };
                match result {
                    Ok(()) => tracing::info!(index, "sent"),
                    Err(e) => tracing::warn!(index, error = %e, "send failed"),
                }
            }
            Command::Broadcast { text } => {
                let targets = lock(peers)?.list_active();
                let text = text.as_str();
                let sends = targets.iter().map(|p| async move {
                    (p.address, self.send(p.address, MessageType::Text, text).await)
                });
                let results = join_all(sends).await;
                let delivered = results.iter().filter(|(_, r)| r.is_ok()).count();
                for (addr, result) in &results {
                    if let Err(e) = result {
                        tracing::warn!(peer = %addr, error = %e, "broadcast send failed");
                    }
                }
                tracing::info!(delivered, total = results.len(), "broadcast sent");
            }
            Command::Debug | Command::Quit => {}
        }
        Ok(())
    }

    /// Send `QUIT` to every active peer concurrently, bounded by the quit
    /// deadline.
    pub async fn broadcast_quit(&self, peers: &SharedPeerTable) -> Result<()> {
        let targets = lock(peers)?.list_active();
        tracing::info!(peers = targets.len(), "sending quit to active peers");

        let sends = targets.iter().map(|p| async move {
            (p.address, self.send(p.address, MessageType::Quit, "").await)
        });
        let deadline = self.timings.quit_broadcast_deadline;
        match tokio::time::timeout(deadline, join_all(sends)).await {
            Ok(results) => {
                for (addr, result) in results {
                    if let Err(e) = result {
                        tracing::warn!(peer = %addr, error = %e, "quit not delivered");
                    }
                }
            }
            Err(_) => tracing::warn!("quit broadcast deadline passed"),
        }
        Ok(())
    }
}
