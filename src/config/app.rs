//! Application configuration structures.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::collector::{MIN_INTERVAL, PushConfig};
use crate::device::{Credentials, DiscoveryOptions};
use crate::metrics::Catalog;
use crate::tariff::{TariffConfig, TimeOfUseCalculator};

use super::validation::{ConfigError, parse_duration, require_non_zero};

// =============================================================================
// Log Format
// =============================================================================

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Prometheus exporter for local-network smart plugs.
///
/// Every option can also be set through the environment variable named
/// next to it. Values are read once at startup.
#[derive(Parser, Debug, Clone)]
#[command(name = "kasa-exporter", version, about, long_about = None)]
pub struct AppConfig {
    /// Address the metrics server binds to
    #[arg(long, env = "METRICS_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port the metrics server listens on
    #[arg(long, env = "METRICS_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Discovery username
    #[arg(long, env = "KASA_USERNAME")]
    pub username: Option<String>,

    /// Discovery password
    #[arg(long, env = "KASA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Address discovery requests are sent to
    #[arg(long, env = "DISCOVERY_TARGET", default_value = "255.255.255.255")]
    pub discovery_target: String,

    /// How long each discovery round listens for replies
    #[arg(long, env = "DISCOVERY_TIMEOUT", default_value = "3s", value_parser = parse_duration)]
    pub discovery_timeout: Duration,

    /// Per-device refresh timeout
    #[arg(long, env = "DEVICE_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub device_timeout: Duration,

    /// Interval between discovery and refresh rounds
    #[arg(long, env = "SCRAPE_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub scrape_interval: Duration,

    /// Interval between staleness checks
    #[arg(long, env = "PRUNE_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub prune_interval: Duration,

    /// Time without a successful refresh after which a device is dropped
    #[arg(long, env = "STALENESS_THRESHOLD", default_value = "60s", value_parser = parse_duration)]
    pub staleness_threshold: Duration,

    /// Push the metric snapshot to a push gateway
    #[arg(long, env = "PUSH_GATEWAY_ENABLED")]
    pub push_gateway_enabled: bool,

    /// Push gateway host
    #[arg(long, env = "PUSH_GATEWAY_HOST", default_value = "localhost")]
    pub push_gateway_host: String,

    /// Push gateway port
    #[arg(long, env = "PUSH_GATEWAY_PORT", default_value_t = 9091)]
    pub push_gateway_port: u16,

    /// Interval between pushes
    #[arg(long, env = "PUSH_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub push_interval: Duration,

    /// Time-of-use tariff table (YAML); built-in table when unset
    #[arg(long, env = "TARIFF_CONFIG")]
    pub tariff_config: Option<PathBuf>,

    /// Additional state metrics to export (YAML)
    #[arg(long, env = "EXTRA_METRICS_FILE")]
    pub extra_metrics_file: Option<PathBuf>,

    /// Run against simulated devices instead of the network
    #[arg(long, env = "SIMULATE")]
    pub simulate: bool,

    /// Number of simulated devices
    #[arg(long, env = "SIMULATED_DEVICES", default_value_t = 3)]
    pub simulated_devices: usize,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the first invalid option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::ValidationError(format!("invalid bind address '{}'", self.bind)))?;

        if self.port == 0 {
            return Err(ConfigError::ValidationError("metrics port must be non-zero".into()));
        }

        if self.discovery_target.trim().is_empty() {
            return Err(ConfigError::ValidationError("discovery target is empty".into()));
        }

        require_non_zero("discovery timeout", self.discovery_timeout)?;
        require_non_zero("device timeout", self.device_timeout)?;
        require_non_zero("staleness threshold", self.staleness_threshold)?;
        require_non_zero("scrape interval", self.scrape_interval)?;
        require_non_zero("prune interval", self.prune_interval)?;

        if self.push_gateway_enabled {
            if self.push_gateway_host.trim().is_empty() {
                return Err(ConfigError::ValidationError("push gateway host is empty".into()));
            }
            if self.push_gateway_port == 0 {
                return Err(ConfigError::ValidationError(
                    "push gateway port must be non-zero".into(),
                ));
            }
            require_non_zero("push interval", self.push_interval)?;
        }

        if self.simulate && self.simulated_devices == 0 {
            return Err(ConfigError::ValidationError(
                "simulated device count must be at least 1".into(),
            ));
        }

        for (name, interval) in [
            ("scrape interval", self.scrape_interval),
            ("prune interval", self.prune_interval),
            ("push interval", self.push_interval),
        ] {
            if interval < MIN_INTERVAL {
                tracing::warn!(
                    option = name,
                    interval = %humantime::format_duration(interval),
                    minimum = %humantime::format_duration(MIN_INTERVAL),
                    "Interval below minimum, it will be clamped"
                );
            }
        }

        Ok(())
    }

    /// Socket address of the metrics server.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("invalid bind address '{}'", self.bind)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            target: self.discovery_target.clone(),
            timeout: self.discovery_timeout,
        }
    }

    /// Push gateway target, when pushing is enabled.
    pub fn push_config(&self) -> Option<PushConfig> {
        self.push_gateway_enabled.then(|| {
            PushConfig::new(self.push_gateway_host.clone(), self.push_gateway_port)
                .with_interval(self.push_interval)
        })
    }

    /// Build the tariff calculator from the configured table, or the built-in one.
    pub fn load_tariff(&self) -> Result<TimeOfUseCalculator, ConfigError> {
        let table = match &self.tariff_config {
            Some(path) => TariffConfig::load(path)?,
            None => TariffConfig::default(),
        };
        Ok(TimeOfUseCalculator::new(table)?)
    }

    /// Extra state metrics declared in [`AppConfig::extra_metrics_file`].
    pub fn load_extra_metrics(&self) -> Result<Catalog, ConfigError> {
        match &self.extra_metrics_file {
            Some(path) => Ok(Catalog::load(path)?),
            None => Ok(Catalog::new()),
        }
    }
}
