//! Metric Layer
//!
//! Declarative extraction of device telemetry into a Prometheus registry.
//!
//! # Architecture
//!
//! - [`Catalog`]: ordered `{metric key -> MetricSpec}` declaration
//! - [`DimensionSpec`]: fixed label set shared by every metric
//! - [`Extractor`]: registers one instrument per metric, then writes samples per device
//!
//! # Example
//!
//! ```rust
//! use kasa_exporter::metrics::{Catalog, DimensionSpec, Extractor, MetricSpec};
//!
//! let registry = prometheus::Registry::new();
//! let catalog = Catalog::new()
//!     .with("current_consumption", MetricSpec::gauge().with_help("Power draw in watts"))
//!     .with("state", MetricSpec::enumeration(["on", "off"]));
//! let dimensions = DimensionSpec::new().attribute("alias").attribute("model");
//!
//! let extractor = Extractor::register_all(&registry, &catalog, dimensions).unwrap();
//! assert_eq!(extractor.len(), 2);
//! ```

mod extractor;
mod instrument;
mod spec;

pub use extractor::{Extractor, UpdateReport, sanitize_metric_name};
pub use instrument::InstrumentError;
pub use spec::{
    Catalog, CatalogError, Dimension, DimensionSpec, ExtractError, LabelFn, MetricDeclaration,
    MetricKind, MetricSpec, Sample, UNKNOWN_LABEL, ValueFn, is_valid_label_name,
};
