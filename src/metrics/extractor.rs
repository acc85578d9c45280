//! Catalog registration and per-device updates.

use std::collections::HashSet;
use std::sync::OnceLock;

use prometheus::Registry;
use regex::Regex;

use super::instrument::Instrument;
use super::spec::{
    Catalog, CatalogError, DimensionSpec, ExtractError, LabelFn, MetricKind, MetricSpec, Sample,
    UNKNOWN_LABEL, is_valid_label_name,
};
use crate::device::{Device, StateSnapshot};

/// Sanitize a catalog key into a metric name.
///
/// Lowercases, turns spaces into underscores and strips everything outside
/// `[a-z0-9_]`.
///
/// ```
/// use kasa_exporter::metrics::sanitize_metric_name;
///
/// assert_eq!(sanitize_metric_name("CPU Usage %"), "cpu_usage_");
/// assert_eq!(sanitize_metric_name("Current consumption"), "current_consumption");
/// ```
pub fn sanitize_metric_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid =
        INVALID.get_or_init(|| Regex::new(r"[^a-z0-9_]").expect("failed to compile name regex"));

    invalid
        .replace_all(&name.to_lowercase().replace(' ', "_"), "")
        .into_owned()
}

/// Outcome of one [`Extractor::update`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Metrics written.
    pub written: usize,
    /// Metrics skipped because the value was absent.
    pub absent: usize,
    /// Metrics skipped because an accessor or the instrument failed.
    pub failed: usize,
}

struct RegisteredMetric {
    key: String,
    name: String,
    spec: MetricSpec,
    instrument: Instrument,
}

/// Projects device telemetry onto a fixed set of registered instruments.
pub struct Extractor {
    dimensions: DimensionSpec,
    metrics: Vec<RegisteredMetric>,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("dimensions", &self.dimensions)
            .field("metrics", &self.metrics.iter().map(|m| &m.name).collect::<Vec<_>>())
            .finish()
    }
}

impl Extractor {
    /// Validate `catalog` and create one instrument per metric in `registry`.
    ///
    /// Label names of each instrument are the dimension names followed by
    /// the metric's derived label names; they never change afterwards.
    ///
    /// # Errors
    /// Any invalid declaration aborts the whole registration.
    pub fn register_all(
        registry: &Registry,
        catalog: &Catalog,
        dimensions: DimensionSpec,
    ) -> Result<Self, CatalogError> {
        let mut dimension_names = HashSet::new();
        for name in dimensions.names() {
            if !is_valid_label_name(name) {
                return Err(CatalogError::InvalidLabelName(name.to_string()));
            }
            if !dimension_names.insert(name) {
                return Err(CatalogError::LabelConflict {
                    metric: "*".to_string(),
                    label: name.to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        let mut metrics = Vec::with_capacity(catalog.len());

        for (key, spec) in catalog.iter() {
            let name = sanitize_metric_name(key);
            if name.is_empty() {
                return Err(CatalogError::EmptyName(key.to_string()));
            }
            if !seen.insert(name.clone()) {
                return Err(CatalogError::DuplicateMetric {
                    metric: key.to_string(),
                    name,
                });
            }
            spec.validate(key)?;

            let labels = label_names(key, &name, spec, &dimensions)?;
            let help = spec.help.as_deref().unwrap_or(key);
            let instrument = Instrument::register(registry, &name, help, spec, &labels)
                .map_err(|source| CatalogError::Backend {
                    metric: key.to_string(),
                    source,
                })?;

            tracing::info!(metric = %key, name = %name, kind = %spec.kind, "Registered metric");
            metrics.push(RegisteredMetric {
                key: key.to_string(),
                name,
                spec: spec.clone(),
                instrument,
            });
        }

        Ok(Self {
            dimensions,
            metrics,
        })
    }

    /// Sanitized names of the registered metrics.
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Write one sample per metric for `device`.
    ///
    /// Metrics are independent: an absent value, a failing accessor or a
    /// rejected write skips only that metric.
    pub fn update(&self, device: &dyn Device) -> UpdateReport {
        let mut report = UpdateReport::default();
        let fixed = self.fixed_labels(device);
        let state = device.state();

        for metric in &self.metrics {
            let sample = match resolve_value(metric, device, &state) {
                Ok(Some(sample)) => sample,
                Ok(None) => {
                    tracing::trace!(metric = %metric.key, address = %device.address(), "No value, skipping");
                    report.absent += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        metric = %metric.key,
                        address = %device.address(),
                        error = %e,
                        "Failed to read metric value"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let mut labels = fixed.clone();
            for (label, f) in &metric.spec.derived_labels {
                labels.push((label.clone(), eval_label(label, f, device)));
            }

            match metric.instrument.write(&labels, &sample) {
                Ok(()) => {
                    tracing::debug!(
                        metric = %metric.key,
                        address = %device.address(),
                        value = ?sample,
                        "Updated metric"
                    );
                    report.written += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        metric = %metric.key,
                        address = %device.address(),
                        error = %e,
                        "Failed to write metric"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Remove every series carrying `device`'s fixed labels.
    ///
    /// Called once the device has left the registry so its last readings
    /// stop being exported. Returns the number of series removed.
    pub fn forget(&self, device: &dyn Device) -> usize {
        let fixed = self.fixed_labels(device);
        let removed: usize = self
            .metrics
            .iter()
            .map(|metric| metric.instrument.forget(&fixed))
            .sum();
        tracing::debug!(address = %device.address(), series = removed, "Removed device series");
        removed
    }

    fn fixed_labels(&self, device: &dyn Device) -> Vec<(String, String)> {
        self.dimensions
            .iter()
            .map(|dim| {
                let value = match &dim.accessor {
                    Some(f) => eval_label(&dim.name, f, device),
                    None => device
                        .attribute(&dim.name)
                        .unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
                };
                (dim.name.clone(), value)
            })
            .collect()
    }
}

/// Fixed dimensions, then derived labels, then kind-specific extras; all unique.
fn label_names(
    key: &str,
    name: &str,
    spec: &MetricSpec,
    dimensions: &DimensionSpec,
) -> Result<Vec<String>, CatalogError> {
    let mut labels: Vec<String> = dimensions.names().map(str::to_string).collect();

    for (label, _) in &spec.derived_labels {
        if !is_valid_label_name(label) {
            return Err(CatalogError::InvalidLabelName(label.clone()));
        }
        if labels.contains(label) {
            return Err(CatalogError::LabelConflict {
                metric: key.to_string(),
                label: label.clone(),
            });
        }
        labels.push(label.clone());
    }

    let extras: Vec<&str> = match spec.kind {
        MetricKind::Enum => vec![name],
        MetricKind::Info => spec
            .info_keys
            .iter()
            .flatten()
            .map(String::as_str)
            .collect(),
        _ => Vec::new(),
    };
    let mut extra_seen = HashSet::new();
    for extra in extras {
        if !is_valid_label_name(extra) {
            return Err(CatalogError::InvalidLabelName(extra.to_string()));
        }
        if labels.iter().any(|l| l == extra) || !extra_seen.insert(extra) {
            return Err(CatalogError::LabelConflict {
                metric: key.to_string(),
                label: extra.to_string(),
            });
        }
    }

    Ok(labels)
}

fn resolve_value(
    metric: &RegisteredMetric,
    device: &dyn Device,
    state: &StateSnapshot,
) -> Result<Option<Sample>, ExtractError> {
    match &metric.spec.value {
        Some(f) => f(device),
        None => Ok(state.get(&metric.key).map(Sample::from)),
    }
}

fn eval_label(label: &str, f: &LabelFn, device: &dyn Device) -> String {
    f(device).unwrap_or_else(|e| {
        tracing::warn!(
            label = %label,
            address = %device.address(),
            error = %e,
            "Failed to read label, using sentinel"
        );
        UNKNOWN_LABEL.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, Reading};
    use prometheus::proto::{Metric, MetricFamily};
    use std::collections::BTreeMap;

    /// Device with a fixed state map.
    struct TestDevice {
        address: String,
        alias: String,
        state: StateSnapshot,
    }

    impl TestDevice {
        fn new(address: &str, alias: &str) -> Self {
            Self {
                address: address.to_string(),
                alias: alias.to_string(),
                state: BTreeMap::new(),
            }
        }

        fn with(mut self, key: &str, value: impl Into<Reading>) -> Self {
            self.state.insert(key.to_string(), value.into());
            self
        }
    }

    #[async_trait::async_trait]
    impl Device for TestDevice {
        fn address(&self) -> &str {
            &self.address
        }

        fn device_id(&self) -> Option<String> {
            Some(format!("id-{}", self.alias))
        }

        fn alias(&self) -> String {
            self.alias.clone()
        }

        fn model(&self) -> String {
            "TEST1".to_string()
        }

        fn state(&self) -> StateSnapshot {
            self.state.clone()
        }

        async fn refresh(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn dimensions() -> DimensionSpec {
        DimensionSpec::new().attribute("alias").attribute("model")
    }

    fn family(registry: &Registry, name: &str) -> Option<MetricFamily> {
        registry.gather().into_iter().find(|f| f.get_name() == name)
    }

    fn series_count(registry: &Registry, name: &str) -> usize {
        family(registry, name).map_or(0, |f| f.get_metric().len())
    }

    fn labels_of(metric: &Metric) -> BTreeMap<String, String> {
        metric
            .get_label()
            .iter()
            .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
            .collect()
    }

    fn find_series(registry: &Registry, name: &str, pairs: &[(&str, &str)]) -> Option<Metric> {
        family(registry, name)?
            .get_metric()
            .iter()
            .find(|m| {
                let labels = labels_of(m);
                pairs
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
    }

    #[test]
    fn test_sanitize_metric_name() {
        assert_eq!(sanitize_metric_name("CPU Usage %"), "cpu_usage_");
        assert_eq!(sanitize_metric_name("signal_level"), "signal_level");
        assert_eq!(sanitize_metric_name("Temp (°C)"), "temp_c");
        assert_eq!(sanitize_metric_name("%%%"), "");
    }

    #[test]
    fn test_sanitized_names_only_contain_allowed_characters() {
        for input in ["Ünïcode Näme", "a-b.c/d", "  spaced  out ", "MiXeD_123!"] {
            let name = sanitize_metric_name(input);
            assert!(
                name.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
                "{input:?} -> {name:?}"
            );
        }
    }

    #[test]
    fn test_register_all_creates_every_instrument() {
        let registry = Registry::new();
        let catalog = Catalog::new()
            .with("cpu_usage", MetricSpec::gauge())
            .with("memory_usage", MetricSpec::counter())
            .with("response_time", MetricSpec::summary())
            .with("request_size", MetricSpec::histogram());

        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();
        let names: Vec<_> = extractor.metric_names().collect();
        assert_eq!(
            names,
            vec!["cpu_usage", "memory_usage", "response_time", "request_size"]
        );
    }

    #[test]
    fn test_register_all_rejects_duplicate_sanitized_names() {
        let registry = Registry::new();
        let catalog = Catalog::new()
            .with("Signal Level", MetricSpec::gauge())
            .with("signal_level", MetricSpec::gauge());

        let err = Extractor::register_all(&registry, &catalog, dimensions()).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateMetric { ref name, .. } if name == "signal_level"));
    }

    #[test]
    fn test_register_all_rejects_derived_label_overlapping_dimension() {
        let registry = Registry::new();
        let catalog = Catalog::new().with(
            "cost",
            MetricSpec::gauge().with_derived_label("alias", |_| Ok("x".into())),
        );

        let err = Extractor::register_all(&registry, &catalog, dimensions()).unwrap_err();
        assert!(matches!(err, CatalogError::LabelConflict { ref label, .. } if label == "alias"));
    }

    #[test]
    fn test_register_all_rejects_empty_name() {
        let registry = Registry::new();
        let catalog = Catalog::new().with("%%", MetricSpec::gauge());
        let err = Extractor::register_all(&registry, &catalog, dimensions()).unwrap_err();
        assert!(matches!(err, CatalogError::EmptyName(_)));
    }

    #[test]
    fn test_register_all_surfaces_backend_errors() {
        let registry = Registry::new();
        // Sanitizes to a name starting with a digit, which the backend refuses.
        let catalog = Catalog::new().with("5v rail", MetricSpec::gauge());
        let err = Extractor::register_all(&registry, &catalog, dimensions()).unwrap_err();
        assert!(matches!(err, CatalogError::Backend { .. }));
    }

    #[test]
    fn test_update_round_trip() {
        let registry = Registry::new();
        let catalog = Catalog::new()
            .with("temperature", MetricSpec::gauge())
            .with("errors", MetricSpec::counter())
            .with("latency", MetricSpec::summary())
            .with(
                "response_time",
                MetricSpec::histogram().with_buckets(vec![0.5, 1.0, 2.0]),
            )
            .with(
                "version",
                MetricSpec::info(["version", "buildhost"]).with_value(|_| {
                    Ok(Some(Sample::info([
                        ("version", "1.0.0"),
                        ("buildhost", "localhost"),
                    ])))
                }),
            )
            .with(
                "status",
                MetricSpec::enumeration(["starting", "running", "stopped"]),
            )
            .with(
                "cost",
                MetricSpec::gauge()
                    .with_value(|d| Ok(d.feature("temperature").and_then(|r| r.as_f64()).map(Sample::from)))
                    .with_derived_label("season", |_| Ok("summer".into())),
            );
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        let device = TestDevice::new("10.0.0.2", "desk")
            .with("temperature", 21.5)
            .with("errors", 3.0)
            .with("latency", 0.25)
            .with("response_time", 0.75)
            .with("status", "running");

        let report = extractor.update(&device);
        assert_eq!(
            report,
            UpdateReport {
                written: 7,
                absent: 0,
                failed: 0
            }
        );

        let fixed = [("alias", "desk"), ("model", "TEST1")];
        let gauge = find_series(&registry, "temperature", &fixed).unwrap();
        assert_eq!(gauge.get_gauge().get_value(), 21.5);
        assert_eq!(labels_of(&gauge).len(), 2);

        let counter = find_series(&registry, "errors", &fixed).unwrap();
        assert_eq!(counter.get_counter().get_value(), 3.0);

        let sum = find_series(&registry, "latency_sum", &fixed).unwrap();
        assert_eq!(sum.get_gauge().get_value(), 0.25);
        let count = find_series(&registry, "latency_count", &fixed).unwrap();
        assert_eq!(count.get_counter().get_value(), 1.0);

        let histogram = find_series(&registry, "response_time", &fixed).unwrap();
        assert_eq!(histogram.get_histogram().get_sample_count(), 1);

        let info = find_series(
            &registry,
            "version_info",
            &[("version", "1.0.0"), ("buildhost", "localhost")],
        )
        .unwrap();
        assert_eq!(info.get_gauge().get_value(), 1.0);

        assert_eq!(series_count(&registry, "status"), 3);
        let running = find_series(&registry, "status", &[("status", "running")]).unwrap();
        assert_eq!(running.get_gauge().get_value(), 1.0);
        let stopped = find_series(&registry, "status", &[("status", "stopped")]).unwrap();
        assert_eq!(stopped.get_gauge().get_value(), 0.0);

        let cost = find_series(&registry, "cost", &[("season", "summer")]).unwrap();
        assert_eq!(
            labels_of(&cost),
            BTreeMap::from([
                ("alias".to_string(), "desk".to_string()),
                ("model".to_string(), "TEST1".to_string()),
                ("season".to_string(), "summer".to_string()),
            ])
        );
    }

    #[test]
    fn test_update_skips_absent_values() {
        let registry = Registry::new();
        let catalog = Catalog::new()
            .with("temperature", MetricSpec::gauge())
            .with(
                "rssi",
                MetricSpec::gauge().with_value(|d| Ok(d.feature("rssi").as_ref().map(Sample::from))),
            );
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        let device = TestDevice::new("10.0.0.2", "desk").with("temperature", 20.0);
        let report = extractor.update(&device);
        assert_eq!(report.written, 1);
        assert_eq!(report.absent, 1);
        assert_eq!(series_count(&registry, "rssi"), 0);

        // A later update without the value leaves the previous sample untouched.
        let device = TestDevice::new("10.0.0.2", "desk");
        let report = extractor.update(&device);
        assert_eq!(report.absent, 2);
        let gauge = find_series(&registry, "temperature", &[("alias", "desk")]).unwrap();
        assert_eq!(gauge.get_gauge().get_value(), 20.0);
    }

    #[test]
    fn test_label_failure_uses_sentinel_and_still_writes() {
        let registry = Registry::new();
        let dims = DimensionSpec::new()
            .attribute("alias")
            .computed("location", |_| Err(ExtractError::Failed("no location".into())));
        let catalog = Catalog::new().with("temperature", MetricSpec::gauge());
        let extractor = Extractor::register_all(&registry, &catalog, dims).unwrap();

        let device = TestDevice::new("10.0.0.2", "desk").with("temperature", 20.0);
        assert_eq!(extractor.update(&device).written, 1);
        assert!(find_series(&registry, "temperature", &[("location", UNKNOWN_LABEL)]).is_some());
    }

    #[test]
    fn test_missing_attribute_uses_sentinel() {
        let registry = Registry::new();
        let dims = DimensionSpec::new().attribute("alias").attribute("room");
        let catalog = Catalog::new().with("temperature", MetricSpec::gauge());
        let extractor = Extractor::register_all(&registry, &catalog, dims).unwrap();

        let device = TestDevice::new("10.0.0.2", "desk").with("temperature", 20.0);
        extractor.update(&device);
        assert!(find_series(&registry, "temperature", &[("room", UNKNOWN_LABEL)]).is_some());
    }

    #[test]
    fn test_failing_value_does_not_block_other_metrics() {
        let registry = Registry::new();
        let catalog = Catalog::new()
            .with(
                "broken",
                MetricSpec::gauge().with_value(|_| Err(ExtractError::MissingFeature("x".into()))),
            )
            .with("temperature", MetricSpec::gauge());
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        let device = TestDevice::new("10.0.0.2", "desk").with("temperature", 20.0);
        let report = extractor.update(&device);
        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 1);
    }

    #[test]
    fn test_rejected_writes_are_counted() {
        let registry = Registry::new();
        let catalog = Catalog::new()
            .with("errors", MetricSpec::counter())
            .with("status", MetricSpec::enumeration(["on", "off"]))
            .with("temperature", MetricSpec::gauge());
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        let device = TestDevice::new("10.0.0.2", "desk")
            .with("errors", -1.0)
            .with("status", "exploded")
            .with("temperature", "warm");
        let report = extractor.update(&device);
        assert_eq!(report.failed, 3);
        assert_eq!(series_count(&registry, "errors"), 0);
    }

    #[test]
    fn test_counter_accumulates_deltas() {
        let registry = Registry::new();
        let catalog = Catalog::new().with("errors", MetricSpec::counter());
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        extractor.update(&TestDevice::new("a", "desk").with("errors", 2.0));
        extractor.update(&TestDevice::new("a", "desk").with("errors", 3.0));
        let counter = find_series(&registry, "errors", &[("alias", "desk")]).unwrap();
        assert_eq!(counter.get_counter().get_value(), 5.0);
    }

    #[test]
    fn test_info_change_replaces_previous_series() {
        let registry = Registry::new();
        let catalog = Catalog::new().with(
            "firmware",
            MetricSpec::info(["firmware"]).with_value(|d| {
                Ok(d.feature("fw").and_then(|r| r.as_str().map(Sample::from)))
            }),
        );
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        extractor.update(&TestDevice::new("a", "desk").with("fw", "1.0"));
        extractor.update(&TestDevice::new("b", "lamp").with("fw", "1.0"));
        extractor.update(&TestDevice::new("a", "desk").with("fw", "1.1"));

        assert_eq!(series_count(&registry, "firmware_info"), 2);
        assert!(find_series(&registry, "firmware_info", &[("alias", "desk"), ("firmware", "1.1")]).is_some());
        assert!(find_series(&registry, "firmware_info", &[("alias", "desk"), ("firmware", "1.0")]).is_none());
        assert!(find_series(&registry, "firmware_info", &[("alias", "lamp"), ("firmware", "1.0")]).is_some());
    }

    #[test]
    fn test_distinct_devices_write_distinct_series() {
        let registry = Registry::new();
        let catalog = Catalog::new().with("temperature", MetricSpec::gauge());
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        extractor.update(&TestDevice::new("a", "desk").with("temperature", 20.0));
        extractor.update(&TestDevice::new("b", "lamp").with("temperature", 25.0));
        assert_eq!(series_count(&registry, "temperature"), 2);
    }

    #[test]
    fn test_forget_removes_only_that_device() {
        let registry = Registry::new();
        let catalog = Catalog::new()
            .with("temperature", MetricSpec::gauge())
            .with("relay", MetricSpec::enumeration(["on", "off"]))
            .with(
                "firmware",
                MetricSpec::info(["firmware"]).with_value(|d| {
                    Ok(d.feature("fw").and_then(|r| r.as_str().map(Sample::from)))
                }),
            );
        let extractor = Extractor::register_all(&registry, &catalog, dimensions()).unwrap();

        let desk = TestDevice::new("a", "desk")
            .with("temperature", 20.0)
            .with("relay", "on")
            .with("fw", "1.0");
        let lamp = TestDevice::new("b", "lamp").with("temperature", 25.0);
        extractor.update(&desk);
        extractor.update(&lamp);

        // temperature, two relay states, firmware
        assert_eq!(extractor.forget(&desk), 4);
        assert_eq!(series_count(&registry, "temperature"), 1);
        assert!(find_series(&registry, "temperature", &[("alias", "lamp")]).is_some());
        assert_eq!(series_count(&registry, "relay"), 0);
        assert_eq!(series_count(&registry, "firmware_info"), 0);

        // A returning device starts from a clean record.
        extractor.update(&desk);
        assert_eq!(series_count(&registry, "firmware_info"), 1);
        assert_eq!(extractor.forget(&lamp), 1);
    }
}
