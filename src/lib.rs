//! Kasa Exporter - Smart Plug Telemetry Library
//!
//! This crate discovers smart plugs on the local network, refreshes their
//! telemetry on a fixed cadence and projects it onto Prometheus instruments.
//! It can be used as a library, or run as a standalone binary with the
//! `kasa-exporter` executable.
//!
//! # Architecture
//!
//! - **Metrics**: declarative catalog validated once, then written per device
//! - **Device**: device/discovery traits, the legacy plug protocol and a simulator
//! - **Collector**: device registry and the scrape, prune and push routines
//! - **Tariff**: time-of-use season and rate lookups used to price consumption
//! - **Server**: metric exposition, registry diagnostics and liveness check
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kasa_exporter::collector::{DeviceRegistry, RoutineScheduler, ScrapeRoutine};
//! use kasa_exporter::device::catalog::{simulated_catalog, simulated_dimensions};
//! use kasa_exporter::device::simulated::SimulatedDiscovery;
//! use kasa_exporter::metrics::Extractor;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = prometheus::Registry::new();
//! let devices = Arc::new(DeviceRegistry::new(Arc::new(SimulatedDiscovery::new(3)), &metrics)?);
//! let extractor = Extractor::register_all(&metrics, &simulated_catalog(), simulated_dimensions())?;
//!
//! let scheduler = RoutineScheduler::new(&metrics).await?;
//! scheduler.spawn(ScrapeRoutine::new(devices, Arc::new(extractor))).await?;
//! scheduler.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod device;
pub mod metrics;
pub mod server;
pub mod tariff;

pub use collector::{DeviceRegistry, RoutineScheduler};
pub use config::AppConfig;
pub use metrics::{Catalog, Extractor, MetricSpec};
pub use tariff::TimeOfUseCalculator;
