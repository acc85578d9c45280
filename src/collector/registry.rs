//! Live device registry with staleness pruning.
//!
//! Each entry pairs a device handle with its last successful check-in, so
//! the handle set and the check-in set can never disagree. All mutation goes
//! through a single async `RwLock`, one writer at a time per public method.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{IntCounter, IntGauge, Registry};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::collector::{CollectorError, Routine, Schedule};
use crate::device::{
    Credentials, Device, DeviceError, DiscoveredDevices, Discovery, DiscoveryOptions,
};
use crate::metrics::Extractor;

/// Default staleness threshold (60 seconds).
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(60);

/// Default prune interval (10 seconds).
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(10);

struct Entry {
    device: Arc<dyn Device>,
    last_checkin: DateTime<Utc>,
}

/// Diagnostic view of one registered device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub alias: String,
    pub model: String,
    pub address: String,
    pub last_checkin: DateTime<Utc>,
}

/// Registry gauges and counters.
struct RegistryMetrics {
    total: IntGauge,
    discovered: IntCounter,
    pruned: IntCounter,
}

impl RegistryMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let total = IntGauge::new(
            "device_registry_total_devices",
            "Devices currently in the registry",
        )?;
        let discovered = IntCounter::new(
            "device_registry_discovered_devices_total",
            "Devices returned by discovery",
        )?;
        let pruned = IntCounter::new(
            "device_registry_pruned_devices_total",
            "Devices removed for staleness",
        )?;
        registry.register(Box::new(total.clone()))?;
        registry.register(Box::new(discovered.clone()))?;
        registry.register(Box::new(pruned.clone()))?;
        Ok(Self {
            total,
            discovered,
            pruned,
        })
    }
}

/// Authoritative set of live devices.
pub struct DeviceRegistry {
    discovery: Arc<dyn Discovery>,
    credentials: Credentials,
    options: DiscoveryOptions,
    staleness_threshold: Duration,
    entries: RwLock<HashMap<String, Entry>>,
    metrics: RegistryMetrics,
}

impl DeviceRegistry {
    /// Create an empty registry whose gauges and counters live in `registry`.
    pub fn new(discovery: Arc<dyn Discovery>, registry: &Registry) -> Result<Self, CollectorError> {
        Ok(Self {
            discovery,
            credentials: Credentials::default(),
            options: DiscoveryOptions::default(),
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            entries: RwLock::new(HashMap::new()),
            metrics: RegistryMetrics::register(registry)?,
        })
    }

    /// Set the credentials handed to discovery.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the discovery target and listen window.
    pub fn with_options(mut self, options: DiscoveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the maximum age of a check-in before the device is pruned.
    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Run one discovery round.
    ///
    /// Every returned address gets the new handle and a fresh check-in.
    /// Addresses not returned keep their entry until the pruning sweep
    /// removes them.
    ///
    /// # Errors
    /// Returns the discovery error; the registry is left unchanged.
    pub async fn discover(&self) -> Result<DiscoveredDevices, DeviceError> {
        // The network round happens outside the lock so pruning is never blocked by it.
        let found = self
            .discovery
            .discover(&self.credentials, &self.options)
            .await?;

        let now = Utc::now();
        let mut entries = self.entries.write().await;
        for (address, device) in &found {
            entries.insert(
                address.clone(),
                Entry {
                    device: Arc::clone(device),
                    last_checkin: now,
                },
            );
        }
        self.metrics.discovered.inc_by(found.len() as u64);
        self.metrics.total.set(entries.len() as i64);

        tracing::debug!(found = found.len(), total = entries.len(), "Discovery round complete");
        Ok(found)
    }

    /// Stamp a successful refresh. Returns `false` if `address` is not registered.
    pub async fn check_in(&self, address: &str) -> bool {
        self.check_in_at(address, Utc::now()).await
    }

    /// Like [`check_in`](Self::check_in) with an explicit time. Check-ins never move backwards.
    pub async fn check_in_at(&self, address: &str, at: DateTime<Utc>) -> bool {
        match self.entries.write().await.get_mut(address) {
            Some(entry) => {
                entry.last_checkin = entry.last_checkin.max(at);
                true
            }
            None => false,
        }
    }

    /// Remove every device whose last check-in is older than the threshold.
    ///
    /// Returns the removed addresses.
    pub async fn prune(&self, now: DateTime<Utc>) -> Vec<String> {
        self.prune_devices(now)
            .await
            .into_iter()
            .map(|(address, _)| address)
            .collect()
    }

    /// Like [`prune`](Self::prune), but hands back the removed handles.
    pub async fn prune_devices(&self, now: DateTime<Utc>) -> Vec<(String, Arc<dyn Device>)> {
        let threshold = chrono::Duration::from_std(self.staleness_threshold)
            .unwrap_or(chrono::Duration::MAX);

        let mut entries = self.entries.write().await;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now - e.last_checkin > threshold)
            .map(|(address, _)| address.clone())
            .collect();

        let mut pruned = Vec::with_capacity(stale.len());
        for address in stale {
            if let Some(entry) = entries.remove(&address) {
                tracing::info!(
                    address = %address,
                    alias = %entry.device.alias(),
                    last_checkin = %entry.last_checkin,
                    "Pruned stale device"
                );
                self.metrics.pruned.inc();
                pruned.push((address, entry.device));
            }
        }
        self.metrics.total.set(entries.len() as i64);
        pruned
    }

    /// Snapshot of `(address, handle)` pairs.
    pub async fn devices(&self) -> Vec<(String, Arc<dyn Device>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(address, e)| (address.clone(), Arc::clone(&e.device)))
            .collect()
    }

    /// Diagnostic snapshot, ordered by address.
    pub async fn devices_info(&self) -> Vec<DeviceSummary> {
        let snapshot: Vec<(String, Arc<dyn Device>, DateTime<Utc>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(address, e)| (address.clone(), Arc::clone(&e.device), e.last_checkin))
            .collect();

        let mut info: Vec<DeviceSummary> = snapshot
            .into_iter()
            .map(|(address, device, last_checkin)| DeviceSummary {
                alias: device.alias(),
                model: device.model(),
                address,
                last_checkin,
            })
            .collect();
        info.sort_by(|a, b| a.address.cmp(&b.address));
        info
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Last check-in of `address`, if registered.
    pub async fn last_checkin(&self, address: &str) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .await
            .get(address)
            .map(|e| e.last_checkin)
    }

    /// Devices returned by discovery since start.
    pub fn discovered_total(&self) -> u64 {
        self.metrics.discovered.get()
    }

    /// Devices pruned since start.
    pub fn pruned_total(&self) -> u64 {
        self.metrics.pruned.get()
    }

    /// Value of the total-devices gauge.
    pub fn total_gauge(&self) -> i64 {
        self.metrics.total.get()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field(
                "device_count",
                &self.entries.try_read().map(|e| e.len()).unwrap_or(0),
            )
            .field("staleness_threshold", &self.staleness_threshold)
            .finish_non_exhaustive()
    }
}

/// Pruning sweep routine.
///
/// With an extractor attached, the series of every pruned device are removed
/// from the exposition as well.
#[derive(Debug)]
pub struct PruneRoutine {
    registry: Arc<DeviceRegistry>,
    extractor: Option<Arc<Extractor>>,
    schedule: Schedule,
}

impl PruneRoutine {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            extractor: None,
            schedule: Schedule::interval(DEFAULT_PRUNE_INTERVAL),
        }
    }

    /// Remove pruned devices' series through `extractor`.
    pub fn with_extractor(mut self, extractor: Arc<Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Set the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.schedule = Schedule::interval(interval);
        self
    }
}

#[async_trait::async_trait]
impl Routine for PruneRoutine {
    fn name(&self) -> &str {
        "prune"
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    async fn tick(&self) -> Result<(), CollectorError> {
        let pruned = self.registry.prune_devices(Utc::now()).await;
        if pruned.is_empty() {
            return Ok(());
        }

        let series: usize = match &self.extractor {
            Some(extractor) => pruned
                .iter()
                .map(|(_, device)| extractor.forget(device.as_ref()))
                .sum(),
            None => 0,
        };
        tracing::info!(count = pruned.len(), series, "Pruning sweep removed devices");
        Ok(())
    }
}
