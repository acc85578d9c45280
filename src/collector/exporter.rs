//! Scrape routine: discover, refresh every device and update its metrics.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::collector::{CollectorError, DeviceRegistry, Routine, Schedule};
use crate::device::{Device, DeviceError};
use crate::metrics::{Extractor, UpdateReport};

/// Default scrape interval (10 seconds).
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(10);

/// Default per-device refresh timeout (5 seconds).
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-tick totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeSummary {
    pub devices: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Scrape routine.
///
/// Devices are refreshed concurrently; one device's failure never affects
/// its siblings. Every device is disconnected after its refresh, on success
/// and failure alike.
pub struct ScrapeRoutine {
    registry: Arc<DeviceRegistry>,
    extractor: Arc<Extractor>,
    schedule: Schedule,
    refresh_timeout: Duration,
}

impl ScrapeRoutine {
    pub fn new(registry: Arc<DeviceRegistry>, extractor: Arc<Extractor>) -> Self {
        Self {
            registry,
            extractor,
            schedule: Schedule::interval(DEFAULT_SCRAPE_INTERVAL),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    /// Set the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.schedule = Schedule::interval(interval);
        self
    }

    /// Set the per-device refresh timeout.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Refresh and update every registered device once.
    pub async fn scrape_all(&self) -> ScrapeSummary {
        let devices = self.registry.devices().await;
        let mut summary = ScrapeSummary {
            devices: devices.len(),
            ..ScrapeSummary::default()
        };

        let mut tasks = JoinSet::new();
        for (address, device) in devices {
            let registry = Arc::clone(&self.registry);
            let extractor = Arc::clone(&self.extractor);
            let refresh_timeout = self.refresh_timeout;
            tasks.spawn(async move {
                scrape_device(&registry, &extractor, &address, device.as_ref(), refresh_timeout)
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => summary.refreshed += 1,
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Device scrape task aborted");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

impl std::fmt::Debug for ScrapeRoutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeRoutine")
            .field("schedule", &self.schedule)
            .field("refresh_timeout", &self.refresh_timeout)
            .finish_non_exhaustive()
    }
}

/// Refresh one device, check it in and write its metrics, then disconnect.
async fn scrape_device(
    registry: &DeviceRegistry,
    extractor: &Extractor,
    address: &str,
    device: &dyn Device,
    refresh_timeout: Duration,
) -> Result<UpdateReport, DeviceError> {
    let result = match timeout(refresh_timeout, device.refresh()).await {
        Ok(Ok(())) => {
            registry.check_in(address).await;
            let report = extractor.update(device);
            tracing::info!(
                alias = %device.alias(),
                model = %device.model(),
                address = %address,
                written = report.written,
                failed = report.failed,
                "Scraped device"
            );
            Ok(report)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DeviceError::Timeout),
    };

    if let Err(e) = &result {
        tracing::error!(address = %address, error = %e, "Failed to update device");
    }
    if let Err(e) = device.disconnect().await {
        tracing::warn!(address = %address, error = %e, "Failed to disconnect device");
    }
    result
}

#[async_trait::async_trait]
impl Routine for ScrapeRoutine {
    fn name(&self) -> &str {
        "scrape"
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// A failed discovery still refreshes the devices already registered,
    /// then fails the tick.
    async fn tick(&self) -> Result<(), CollectorError> {
        let discovery = self.registry.discover().await;
        if let Err(e) = &discovery {
            tracing::warn!(error = %e, "Discovery failed, refreshing known devices");
        }

        let summary = self.scrape_all().await;
        tracing::debug!(
            devices = summary.devices,
            refreshed = summary.refreshed,
            failed = summary.failed,
            "Scrape tick complete"
        );

        discovery.map(|_| ()).map_err(CollectorError::from)
    }
}
