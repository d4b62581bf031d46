//! Subscriber setup with a runtime verbosity switch for `/debug`.

use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "debug";

/// Swaps the active filter between the startup one and full debug output.
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
    debug: bool,
}

impl LogControl {
    fn new(handle: reload::Handle<EnvFilter, Registry>, base: String) -> Self {
        Self {
            handle,
            base,
            debug: false,
        }
    }

    /// Flip debug output on or off. Returns the new state.
    pub fn toggle_debug(&mut self) -> bool {
        let next = !self.debug;
        let filter = if next { DEBUG_FILTER } else { self.base.as_str() };
        match self.handle.reload(EnvFilter::new(filter)) {
            Ok(()) => {
                self.debug = next;
                tracing::info!(debug = next, filter, "log level changed");
            }
            Err(e) => tracing::warn!(error = %e, "could not change log level"),
        }
        self.debug
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the default filter.
pub fn init() -> LogControl {
    let base =
        std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    let (filter, handle) = reload::Layer::new(EnvFilter::new(&base));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    LogControl::new(handle, base)
}
