//! Tracing subscriber setup for binaries and tests embedding the crate.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the host. `RUST_LOG` overrides the default level when set.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(debug: bool) -> bool {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .is_ok()
}

/// Install a JSON subscriber for log shipping.
pub fn init_json_tracing(debug: bool) -> bool {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        init_tracing(true);
        assert!(!init_tracing(false));
        assert!(!init_json_tracing(false));
    }
}
