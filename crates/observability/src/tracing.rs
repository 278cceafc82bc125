//! Subscriber installation.

use tracing_subscriber::EnvFilter;

/// Install a JSON subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_with(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}
