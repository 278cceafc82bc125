//! Process-wide tracing setup for the Warden binaries and test harnesses.

pub mod tracing;

/// Install the JSON subscriber with `RUST_LOG` filtering (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init_with("info");
}
