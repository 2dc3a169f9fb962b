//! Log output driven by `[logging]`
//!
//! Hosts that let the service own the global subscriber call
//! [`init_tracing`] once (or build with
//! [`CqfServiceBuilder::install_tracing`](crate::service::CqfServiceBuilder::install_tracing)).
//! The filter sits behind a reload layer, so [`apply_logging`] can change the
//! level later without reinstalling anything.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;
use crate::error::{CqfError, CqfResult};

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Parses a `[logging].level` directive list such as `info` or
/// `octofhir_cqf=debug,warn`.
pub fn parse_level(level: &str) -> CqfResult<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| CqfError::InvalidArgument(format!("invalid logging.level '{level}': {e}")))
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level when it parses.
///
/// Returns `false` when another subscriber was already installed; the level
/// of a foreign subscriber is never touched.
pub fn init_tracing(logging: &LoggingConfig) -> CqfResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_level(&logging.level)?,
    };
    let (layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer())
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER.set(handle);
        tracing::debug!(level = %logging.level, "Tracing installed");
    }
    Ok(installed)
}

/// Swaps the active filter for `logging.level`. Returns `false` when the
/// subscriber was not installed by [`init_tracing`].
pub fn apply_logging(logging: &LoggingConfig) -> CqfResult<bool> {
    let filter = parse_level(&logging.level)?;
    let Some(handle) = FILTER.get() else {
        return Ok(false);
    };
    handle
        .reload(filter)
        .map_err(|e| CqfError::InternalError(format!("log filter reload failed: {e}")))?;
    tracing::info!(level = %logging.level, "Logging level changed");
    Ok(true)
}

/// Directives of the active filter, when [`init_tracing`] installed it.
pub fn active_filter() -> Option<String> {
    FILTER.get()?.with_current(ToString::to_string).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(level: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.into(),
        }
    }

    #[test]
    fn test_parse_level_rejects_bad_directives() {
        assert!(parse_level("info").is_ok());
        assert!(parse_level("octofhir_cqf=debug,warn").is_ok());
        let err = parse_level("octofhir_cqf=loud").unwrap_err();
        assert!(matches!(err, CqfError::InvalidArgument(ref m) if m.contains("logging.level")));
    }

    #[test]
    fn test_level_can_be_changed_after_init() {
        init_tracing(&logging("info")).unwrap();
        if FILTER.get().is_none() {
            // Another subscriber owns the process; nothing to reload.
            assert!(!apply_logging(&logging("debug")).unwrap());
            return;
        }

        assert!(apply_logging(&logging("octofhir_cqf=trace,warn")).unwrap());
        let active = active_filter().unwrap();
        assert!(active.contains("octofhir_cqf=trace"), "{active}");

        // A rejected level leaves the active filter in place.
        assert!(apply_logging(&logging("octofhir_cqf=loud")).is_err());
        assert_eq!(active_filter().unwrap(), active);

        // A second install is refused rather than replacing the filter.
        assert!(!init_tracing(&logging("error")).unwrap());
        assert_eq!(active_filter().unwrap(), active);
    }
}
