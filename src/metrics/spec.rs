//! Declarative metric model: what metrics exist and how each value and label
//! is read from a device.
//!
//! Shapes are declared once (kind, label names, enum states, info keys) and
//! filled many times by the [`Extractor`](super::Extractor).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::device::{Device, Reading};

/// Label value written when a dimension or derived label cannot be read.
pub const UNKNOWN_LABEL: &str = "unknown";

// =============================================================================
// Errors
// =============================================================================

/// Catalog validation and registration errors. All are fatal at startup.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Failed to read a catalog file.
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a catalog file.
    #[error("failed to parse catalog YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Kind string is not one of the six supported kinds.
    #[error("metric '{metric}': unsupported metric kind '{kind}'")]
    UnsupportedMetricKind { metric: String, kind: String },

    /// Enum metric without states.
    #[error("metric '{0}': enum metrics must declare at least one state")]
    MissingEnumStates(String),

    /// States on a non-enum metric.
    #[error("metric '{0}': only enum metrics may declare states")]
    UnexpectedEnumStates(String),

    /// Info metric without info keys.
    #[error("metric '{0}': info metrics must declare their info keys")]
    MissingInfoKeys(String),

    /// Info keys on a non-info metric.
    #[error("metric '{0}': only info metrics may declare info keys")]
    UnexpectedInfoKeys(String),

    /// A metric-specific label collides with another label of the same metric.
    #[error("metric '{metric}': label '{label}' is declared more than once")]
    LabelConflict { metric: String, label: String },

    /// Label name outside `[a-zA-Z_][a-zA-Z0-9_]*`.
    #[error("invalid label name '{0}'")]
    InvalidLabelName(String),

    /// Metric name sanitizes to nothing.
    #[error("metric '{0}' has no valid name characters")]
    EmptyName(String),

    /// Two metrics sanitize to the same name.
    #[error("metric '{metric}' collides with another metric as '{name}'")]
    DuplicateMetric { metric: String, name: String },

    /// The metrics backend refused the instrument.
    #[error("metric '{metric}': registration failed: {source}")]
    Backend {
        metric: String,
        #[source]
        source: prometheus::Error,
    },
}

/// Failure of a value or label accessor for one device.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Feature exists but holds the wrong type.
    #[error("feature '{feature}' is not a {expected}")]
    UnexpectedType {
        feature: String,
        expected: &'static str,
    },

    /// Required feature is missing.
    #[error("feature '{0}' is not available")]
    MissingFeature(String),

    /// Any other accessor failure.
    #[error("{0}")]
    Failed(String),
}

// =============================================================================
// Kinds and samples
// =============================================================================

/// Instrument kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MetricKind {
    Gauge,
    Counter,
    Summary,
    Histogram,
    Info,
    Enum,
}

impl MetricKind {
    /// Parse a kind name for `metric`.
    ///
    /// # Errors
    /// Returns `CatalogError::UnsupportedMetricKind` for anything but the six kinds.
    pub fn parse_for(metric: &str, kind: &str) -> Result<Self, CatalogError> {
        kind.trim()
            .parse()
            .map_err(|_: strum::ParseError| CatalogError::UnsupportedMetricKind {
                metric: metric.to_string(),
                kind: kind.to_string(),
            })
    }
}

/// One value produced for one metric of one device.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// Numeric value for gauges, counters and distributions.
    Number(f64),
    /// Discrete state for enums, or a single info value.
    Text(String),
    /// String-keyed record for info metrics.
    Info(BTreeMap<String, String>),
}

impl Sample {
    /// Short type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Info(_) => "info",
        }
    }

    pub fn info<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::Info(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<&Reading> for Sample {
    fn from(reading: &Reading) -> Self {
        match reading {
            Reading::Number(n) => Self::Number(*n),
            Reading::Flag(b) => Self::Number(if *b { 1.0 } else { 0.0 }),
            Reading::Text(s) => Self::Text(s.clone()),
            Reading::Timestamp(ts) => Self::Number(ts.timestamp() as f64),
        }
    }
}

impl From<f64> for Sample {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Sample {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Sample {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

// =============================================================================
// Accessors
// =============================================================================

/// Reads a metric value. `Ok(None)` means the telemetry is absent.
pub type ValueFn = Arc<dyn Fn(&dyn Device) -> Result<Option<Sample>, ExtractError> + Send + Sync>;

/// Reads one label value.
pub type LabelFn = Arc<dyn Fn(&dyn Device) -> Result<String, ExtractError> + Send + Sync>;

/// Static declaration of one metric.
#[derive(Clone)]
pub struct MetricSpec {
    pub kind: MetricKind,
    /// Help text; defaults to the catalog key.
    pub help: Option<String>,
    /// Value accessor; without one the value is `device.state()[key]`.
    pub value: Option<ValueFn>,
    /// Ordered states, enum metrics only.
    pub states: Option<Vec<String>>,
    /// Info record keys, info metrics only.
    pub info_keys: Option<Vec<String>>,
    /// Metric-specific labels, evaluated on every update.
    pub derived_labels: Vec<(String, LabelFn)>,
    /// Histogram bucket bounds; backend defaults when unset.
    pub buckets: Option<Vec<f64>>,
}

impl MetricSpec {
    pub fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            help: None,
            value: None,
            states: None,
            info_keys: None,
            derived_labels: Vec::new(),
            buckets: None,
        }
    }

    pub fn gauge() -> Self {
        Self::new(MetricKind::Gauge)
    }

    pub fn counter() -> Self {
        Self::new(MetricKind::Counter)
    }

    pub fn summary() -> Self {
        Self::new(MetricKind::Summary)
    }

    pub fn histogram() -> Self {
        Self::new(MetricKind::Histogram)
    }

    pub fn info<S: Into<String>>(keys: impl IntoIterator<Item = S>) -> Self {
        Self {
            info_keys: Some(keys.into_iter().map(Into::into).collect()),
            ..Self::new(MetricKind::Info)
        }
    }

    pub fn enumeration<S: Into<String>>(states: impl IntoIterator<Item = S>) -> Self {
        Self {
            states: Some(states.into_iter().map(Into::into).collect()),
            ..Self::new(MetricKind::Enum)
        }
    }

    #[must_use]
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    #[must_use]
    pub fn with_value<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Device) -> Result<Option<Sample>, ExtractError> + Send + Sync + 'static,
    {
        self.value = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_derived_label<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&dyn Device) -> Result<String, ExtractError> + Send + Sync + 'static,
    {
        self.derived_labels.push((name.into(), Arc::new(f)));
        self
    }

    #[must_use]
    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }

    /// Check the kind-specific fields.
    pub fn validate(&self, metric: &str) -> Result<(), CatalogError> {
        match (self.kind, &self.states) {
            (MetricKind::Enum, None) => {
                return Err(CatalogError::MissingEnumStates(metric.to_string()));
            }
            (MetricKind::Enum, Some(states)) if states.is_empty() => {
                return Err(CatalogError::MissingEnumStates(metric.to_string()));
            }
            (MetricKind::Enum, _) | (_, None) => {}
            (_, Some(_)) => return Err(CatalogError::UnexpectedEnumStates(metric.to_string())),
        }

        match (self.kind, &self.info_keys) {
            (MetricKind::Info, None) => Err(CatalogError::MissingInfoKeys(metric.to_string())),
            (MetricKind::Info, Some(keys)) if keys.is_empty() => {
                Err(CatalogError::MissingInfoKeys(metric.to_string()))
            }
            (MetricKind::Info, _) | (_, None) => Ok(()),
            (_, Some(_)) => Err(CatalogError::UnexpectedInfoKeys(metric.to_string())),
        }
    }
}

impl fmt::Debug for MetricSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSpec")
            .field("kind", &self.kind)
            .field("help", &self.help)
            .field("has_value", &self.value.is_some())
            .field("states", &self.states)
            .field("info_keys", &self.info_keys)
            .field(
                "derived_labels",
                &self.derived_labels.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("buckets", &self.buckets)
            .finish()
    }
}

// =============================================================================
// Dimensions
// =============================================================================

/// One fixed label.
#[derive(Clone)]
pub struct Dimension {
    pub name: String,
    /// Without an accessor the label is `device.attribute(name)`.
    pub accessor: Option<LabelFn>,
}

/// Fixed label set shared by every metric of a catalog.
#[derive(Clone, Default)]
pub struct DimensionSpec {
    dimensions: Vec<Dimension>,
}

impl DimensionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label read as the same-named device attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            accessor: None,
        });
        self
    }

    /// Add a label computed by `f`.
    #[must_use]
    pub fn computed<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&dyn Device) -> Result<String, ExtractError> + Send + Sync + 'static,
    {
        self.dimensions.push(Dimension {
            name: name.into(),
            accessor: Some(Arc::new(f)),
        });
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }
}

impl fmt::Debug for DimensionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Ordered `{metric key -> MetricSpec}` declaration.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<(String, MetricSpec)>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, spec: MetricSpec) -> Self {
        self.insert(key, spec);
        self
    }

    /// Insert or replace a metric.
    pub fn insert(&mut self, key: impl Into<String>, spec: MetricSpec) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = spec,
            None => self.entries.push((key, spec)),
        }
    }

    /// Merge `other` into this catalog; `other` wins on key collisions.
    #[must_use]
    pub fn merge(mut self, other: Catalog) -> Self {
        for (key, spec) in other.entries {
            self.insert(key, spec);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricSpec)> {
        self.entries.iter().map(|(k, s)| (k.as_str(), s))
    }

    pub fn get(&self, key: &str) -> Option<&MetricSpec> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build state-passthrough metrics from declarations.
    ///
    /// # Errors
    /// Returns `CatalogError::UnsupportedMetricKind` for unknown kinds.
    pub fn from_declarations(
        declarations: BTreeMap<String, MetricDeclaration>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for (key, decl) in declarations {
            let kind = MetricKind::parse_for(&key, &decl.kind)?;
            let spec = MetricSpec {
                help: decl.help,
                states: decl.states,
                info_keys: decl.info_keys,
                buckets: decl.buckets,
                ..MetricSpec::new(kind)
            };
            spec.validate(&key)?;
            catalog.insert(key, spec);
        }
        Ok(catalog)
    }

    /// Load declarations from a YAML file of the form `metrics: {name: {kind: gauge}}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let file: CatalogFile = serde_yaml::from_str(&content)?;
        Self::from_declarations(file.metrics)
    }
}

/// Declaration of a state-passthrough metric.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricDeclaration {
    pub kind: String,
    #[serde(default)]
    pub help: Option<String>,
    #[serde(default)]
    pub states: Option<Vec<String>>,
    #[serde(default)]
    pub info_keys: Option<Vec<String>>,
    #[serde(default)]
    pub buckets: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    metrics: BTreeMap<String, MetricDeclaration>,
}

/// Label names in `[a-zA-Z_][a-zA-Z0-9_]*`, excluding the reserved `__` prefix.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__")
}

/// Label map view used by the metrics backend.
pub(crate) fn label_map(labels: &[(String, String)]) -> HashMap<&str, &str> {
    labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}
