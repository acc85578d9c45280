//! Collector Layer
//!
//! Background routines that keep the device registry and the metric
//! instruments current. Each routine runs as a repeated job on its own
//! cadence and shares state with the others only through the
//! [`DeviceRegistry`] and the metrics registry.
//!
//! # Architecture
//!
//! - [`Routine`]: core trait for a scheduled loop body
//! - [`Schedule`]: fixed execution interval
//! - [`RoutineScheduler`]: manages routine lifecycle and graceful shutdown
//! - [`DeviceRegistry`]: live device set with staleness pruning
//! - [`ScrapeRoutine`], [`PruneRoutine`], [`PushRoutine`]: the three loops
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kasa_exporter::collector::{DeviceRegistry, PruneRoutine, RoutineScheduler};
//! use kasa_exporter::device::simulated::SimulatedDiscovery;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = prometheus::Registry::new();
//! let devices = Arc::new(DeviceRegistry::new(Arc::new(SimulatedDiscovery::new(3)), &metrics)?);
//! let scheduler = RoutineScheduler::new(&metrics).await?;
//! scheduler.spawn(PruneRoutine::new(Arc::clone(&devices))).await?;
//! scheduler.start().await?;
//! # Ok(())
//! # }
//! ```

mod exporter;
mod push;
mod registry;
mod scheduler;
mod traits;

pub use exporter::{DEFAULT_REFRESH_TIMEOUT, DEFAULT_SCRAPE_INTERVAL, ScrapeRoutine, ScrapeSummary};
pub use push::{DEFAULT_PUSH_INTERVAL, PUSH_JOB, PushConfig, PushRoutine};
pub use registry::{
    DEFAULT_PRUNE_INTERVAL, DEFAULT_STALENESS_THRESHOLD, DeviceRegistry, DeviceSummary,
    PruneRoutine,
};
pub use scheduler::{DEFAULT_SHUTDOWN_TIMEOUT, JobInfo, RoutineScheduler};
pub use traits::{CollectorError, MIN_INTERVAL, Routine, Schedule, TickStatus};
