//! Fixed protocol timings.

use std::time::{Duration, Instant};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(3);
/// An inbound session with no traffic for this long is torn down.
pub const IDLE_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const LISTEN_RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff after the stream driver had to be reset.
pub const RESET_BACKOFF: Duration = Duration::from_secs(5);
/// Pause before listening again after a close that did not complete cleanly.
pub const POST_ABORT_COOLDOWN: Duration = Duration::from_millis(750);
/// Consecutive listen conflicts tolerated before the driver is reset.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;
/// Data endpoints in the pooled variant.
pub const POOL_SIZE: usize = 4;
/// Pooled slots stuck creating or accepting longer than this are reclaimed.
pub const STALE_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const QUIT_BROADCAST_DEADLINE: Duration = Duration::from_secs(2);

/// Timings used by the connection machines. Tests shrink these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub idle_receive_timeout: Duration,
    pub listen_retry_backoff: Duration,
    pub reset_backoff: Duration,
    pub post_abort_cooldown: Duration,
    pub max_transient_retries: u32,
    pub stale_operation_timeout: Duration,
    pub quit_broadcast_deadline: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            idle_receive_timeout: IDLE_RECEIVE_TIMEOUT,
            listen_retry_backoff: LISTEN_RETRY_BACKOFF,
            reset_backoff: RESET_BACKOFF,
            post_abort_cooldown: POST_ABORT_COOLDOWN,
            max_transient_retries: MAX_TRANSIENT_RETRIES,
            stale_operation_timeout: STALE_OPERATION_TIMEOUT,
            quit_broadcast_deadline: QUIT_BROADCAST_DEADLINE,
        }
    }
}

/// `timeout` cut down to what is left of `budget`, counted from `started`.
/// `None` once the budget is spent. Without a budget `timeout` is returned.
pub fn clip_to_budget(
    timeout: Duration,
    budget: Option<Duration>,
    started: Instant,
) -> Option<Duration> {
    let Some(budget) = budget else {
        return Some(timeout);
    };
    let left = budget.saturating_sub(started.elapsed());
    (!left.is_zero()).then(|| timeout.min(left))
}
