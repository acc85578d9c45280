//! Configuration errors and value parsers.

use std::time::Duration;

use thiserror::Error;

use crate::metrics::CatalogError;
use crate::tariff::TariffError;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Tariff table could not be loaded.
    #[error("tariff config error: {0}")]
    Tariff(#[from] TariffError),

    /// Extra metric declarations could not be loaded.
    #[error("metric catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Parse duration string using humantime.
///
/// Supports various formats: `30s`, `1m`, `5m30s`, `1h`, `100ms`, etc.
///
/// # Examples
///
/// ```
/// use kasa_exporter::config::parse_duration;
///
/// assert_eq!(parse_duration("10s").unwrap().as_secs(), 10);
/// assert_eq!(parse_duration("1m").unwrap().as_secs(), 60);
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Reject a zero duration for the named option.
pub(crate) fn require_non_zero(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ValidationError(format!(
            "{} must be greater than zero",
            name
        )));
    }
    Ok(())
}
