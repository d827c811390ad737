//! Tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{GraphOrmError, Result};

/// Directive used when no level is configured.
pub const DEFAULT_DIRECTIVE: &str = "graphorm=info";

/// Installs a formatted subscriber filtered by `level` (an `EnvFilter`
/// directive such as `"graphorm=debug"`). An empty level falls back to
/// `RUST_LOG`, then to [`DEFAULT_DIRECTIVE`].
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(filter_for(level)?)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| GraphOrmError::configuration("logging already initialized"))
}

pub(crate) fn filter_for(level: &str) -> Result<EnvFilter> {
    let level = level.trim();
    if level.is_empty() {
        return Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)));
    }
    EnvFilter::try_new(level)
        .map_err(|e| GraphOrmError::configuration(format!("invalid log level '{level}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directive_is_kept() {
        assert_eq!(filter_for(" graphorm=debug ").unwrap().to_string(), "graphorm=debug");
    }

    #[test]
    fn malformed_directive_is_a_configuration_error() {
        assert_eq!(filter_for("graphorm=loud").unwrap_err().code(), "Configuration");
    }
}
