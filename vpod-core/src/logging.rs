//! Opt-in tracing setup.
//!
//! The library itself only emits `tracing` events; embedding runtimes
//! usually install their own subscriber. This helper exists for hosts
//! that want the default formatting with an env-filter.

use tracing_subscriber::EnvFilter;

use vpod_shared::{Error, Result};

/// Install a global subscriber with the given default directive,
/// e.g. `"vpod=info"`. Respects `RUST_LOG` overrides.
pub fn init(directive: &str) -> Result<()> {
    let directive = directive
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("log directive: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .try_init()
        .map_err(|e| Error::InvalidConfig(format!("logger: {e}")))
}
