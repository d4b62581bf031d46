//! Console surface of the daemon: shell events go to the log, and stdin
//! lines become commands.

use std::net::IpAddr;
use std::time::Duration;

use csend_services::{PeerRecord, ShellEvents};

/// How often the daemon logs the whole peer table.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Shell that reports everything through tracing.
#[derive(Debug, Default)]
pub struct LogShell;

impl ShellEvents for LogShell {
    fn on_peer_list_changed(&mut self, active: &[PeerRecord]) {
        tracing::info!(count = active.len(), "peer list changed");
        log_peers(active);
    }

    fn on_text_message(&mut self, from: IpAddr, name: &str, text: &str) {
        tracing::info!(peer = %from, name, text, "message");
    }
}

/// Log the active peers with the 1-based indices `/send` expects.
pub fn log_peers(active: &[PeerRecord]) {
    log_matching_peers(active, None);
}

/// Like [`log_peers`], but only peers whose name or address contains
/// `filter` (case-insensitive). Indices stay those of the full list.
pub fn log_matching_peers(active: &[PeerRecord], filter: Option<&str>) {
    for (index, peer) in matching_peers(active, filter) {
        tracing::info!(
            index,
            name = %peer.display_name,
            addr = %peer.address,
            seen_secs_ago = peer.last_seen.elapsed().as_secs(),
            "  peer"
        );
    }
}

fn matching_peers<'a>(
    active: &'a [PeerRecord],
    filter: Option<&str>,
) -> impl Iterator<Item = (usize, &'a PeerRecord)> {
    let needle = filter.map(str::to_lowercase);
    active
        .iter()
        .enumerate()
        .map(|(i, peer)| (i + 1, peer))
        .filter(move |(_, peer)| match &needle {
            Some(needle) => {
                peer.display_name.to_lowercase().contains(needle.as_str())
                    || peer.address.to_string().contains(needle.as_str())
            }
            None => true,
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Active peers, optionally narrowed by a name or address fragment.
    List { filter: Option<String> },
    Send { index: usize, text: String },
    Broadcast { text: String },
    /// Local identity and peer count.
    Status,
    /// Toggle debug logging.
    Debug,
    Quit,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: /send <index> <message>")]
    SendUsage,
    #[error("usage: /broadcast <message>")]
    BroadcastUsage,
}

pub const HELP: &str = "/list [filter], /send <index> <message>, /broadcast <message>, \
                        /status, /debug, /quit, /help";

/// Parse one console line. Surrounding whitespace is ignored.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "/list" | "/peers" => Ok(Command::List {
            filter: (!rest.is_empty()).then(|| rest.to_string()),
        }),
        "/status" => Ok(Command::Status),
        "/debug" => Ok(Command::Debug),
        "/quit" => Ok(Command::Quit),
        "/help" => Ok(Command::Help),
        "/send" => {
            let (index, text) = rest
                .split_once(char::is_whitespace)
                .ok_or(CommandError::SendUsage)?;
            let index = index.parse().map_err(|_| CommandError::SendUsage)?;
            let text = text.trim();
            if text.is_empty() {
                return Err(CommandError::SendUsage);
            }
            Ok(Command::Send {
                index,
                text: text.to_string(),
            })
        }
        "/broadcast" => {
            if rest.is_empty() {
                return Err(CommandError::BroadcastUsage);
            }
            Ok(Command::Broadcast {
                text: rest.to_string(),
            })
        }
        other => Err(CommandError::Unknown(other.to_string())),
    }
}
