//! Configuration for the exporter binary.
//!
//! All options come from command-line flags or their environment variables
//! and are read once at startup:
//! - Metrics server (bind address, port)
//! - Discovery (credentials, broadcast target, timeouts)
//! - Loop cadence (scrape, prune, push) and the staleness threshold
//! - Push gateway target
//! - Tariff table and extra metric declarations (YAML files)

mod app;
mod validation;

pub use app::{AppConfig, LogFormat};
pub use validation::{ConfigError, parse_duration};
