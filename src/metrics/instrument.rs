//! Live instruments backed by `prometheus` vectors.
//!
//! Every instrument is created once with a fixed label-name set. Vectors are
//! safe for concurrent writers, so writes from different devices never need
//! a lock of their own; only info metrics keep a small map of the last
//! record per label-set so a changed record replaces the previous series.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use prometheus::core::{Collector, MetricVec, MetricVecBuilder};
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use thiserror::Error;

use super::spec::{MetricKind, MetricSpec, Sample, label_map};

/// Suffix of info metric names.
const INFO_SUFFIX: &str = "_info";

/// A single write rejected by an instrument.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// Sample type does not fit the instrument kind.
    #[error("{kind} metric cannot record a {got} sample")]
    TypeMismatch { kind: MetricKind, got: &'static str },

    /// Counter increments must be finite and non-negative.
    #[error("counter increment must be finite and non-negative, got {0}")]
    InvalidIncrement(f64),

    /// Enum value is not among the declared states.
    #[error("'{0}' is not a declared state")]
    UnknownState(String),

    /// Backend refused the label-set.
    #[error("metrics backend rejected the write: {0}")]
    Backend(#[from] prometheus::Error),
}

/// Per-kind instrument.
pub(crate) enum Instrument {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Histogram(HistogramVec),
    /// Running `<name>_sum` and `<name>_count`.
    Summary { sum: GaugeVec, count: CounterVec },
    /// `<name>_info` series with the record keys as extra labels.
    Info {
        vec: GaugeVec,
        keys: Vec<String>,
        current: Mutex<HashMap<Vec<String>, Vec<String>>>,
    },
    /// One series per state, `1` for the current state.
    Enum {
        vec: GaugeVec,
        label: String,
        states: Vec<String>,
    },
}

impl Instrument {
    /// Create the instrument for `spec` and register it.
    pub(crate) fn register(
        registry: &Registry,
        name: &str,
        help: &str,
        spec: &MetricSpec,
        labels: &[String],
    ) -> Result<Self, prometheus::Error> {
        let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();

        let instrument = match spec.kind {
            MetricKind::Gauge => {
                let vec = GaugeVec::new(Opts::new(name, help), &label_refs)?;
                registry.register(Box::new(vec.clone()))?;
                Self::Gauge(vec)
            }
            MetricKind::Counter => {
                let vec = CounterVec::new(Opts::new(name, help), &label_refs)?;
                registry.register(Box::new(vec.clone()))?;
                Self::Counter(vec)
            }
            MetricKind::Histogram => {
                let mut opts = HistogramOpts::new(name, help);
                if let Some(buckets) = &spec.buckets {
                    opts = opts.buckets(buckets.clone());
                }
                let vec = HistogramVec::new(opts, &label_refs)?;
                registry.register(Box::new(vec.clone()))?;
                Self::Histogram(vec)
            }
            MetricKind::Summary => {
                let sum = GaugeVec::new(Opts::new(format!("{name}_sum"), help), &label_refs)?;
                let count =
                    CounterVec::new(Opts::new(format!("{name}_count"), help), &label_refs)?;
                registry.register(Box::new(sum.clone()))?;
                registry.register(Box::new(count.clone()))?;
                Self::Summary { sum, count }
            }
            MetricKind::Info => {
                let keys = spec.info_keys.clone().unwrap_or_default();
                let mut all: Vec<&str> = label_refs.clone();
                all.extend(keys.iter().map(String::as_str));
                let vec = GaugeVec::new(Opts::new(format!("{name}{INFO_SUFFIX}"), help), &all)?;
                registry.register(Box::new(vec.clone()))?;
                Self::Info {
                    vec,
                    keys,
                    current: Mutex::new(HashMap::new()),
                }
            }
            MetricKind::Enum => {
                let mut all: Vec<&str> = label_refs.clone();
                all.push(name);
                let vec = GaugeVec::new(Opts::new(name, help), &all)?;
                registry.register(Box::new(vec.clone()))?;
                Self::Enum {
                    vec,
                    label: name.to_string(),
                    states: spec.states.clone().unwrap_or_default(),
                }
            }
        };

        Ok(instrument)
    }

    pub(crate) fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
            Self::Histogram(_) => MetricKind::Histogram,
            Self::Summary { .. } => MetricKind::Summary,
            Self::Info { .. } => MetricKind::Info,
            Self::Enum { .. } => MetricKind::Enum,
        }
    }

    /// Record `sample` for the label-set `labels`.
    pub(crate) fn write(
        &self,
        labels: &[(String, String)],
        sample: &Sample,
    ) -> Result<(), InstrumentError> {
        let mismatch = || InstrumentError::TypeMismatch {
            kind: self.kind(),
            got: sample.type_name(),
        };

        match self {
            Self::Gauge(vec) => {
                let Sample::Number(v) = sample else {
                    return Err(mismatch());
                };
                vec.get_metric_with(&label_map(labels))?.set(*v);
            }
            Self::Counter(vec) => {
                let Sample::Number(v) = sample else {
                    return Err(mismatch());
                };
                if !v.is_finite() || *v < 0.0 {
                    return Err(InstrumentError::InvalidIncrement(*v));
                }
                vec.get_metric_with(&label_map(labels))?.inc_by(*v);
            }
            Self::Histogram(vec) => {
                let Sample::Number(v) = sample else {
                    return Err(mismatch());
                };
                vec.get_metric_with(&label_map(labels))?.observe(*v);
            }
            Self::Summary { sum, count } => {
                let Sample::Number(v) = sample else {
                    return Err(mismatch());
                };
                let map = label_map(labels);
                let sum = sum.get_metric_with(&map)?;
                let count = count.get_metric_with(&map)?;
                sum.add(*v);
                count.inc();
            }
            Self::Info { vec, keys, current } => {
                let values: Vec<String> = match sample {
                    Sample::Info(record) => {
                        if let Some(extra) = record.keys().find(|k| !keys.contains(k)) {
                            tracing::debug!(key = %extra, "Dropping undeclared info key");
                        }
                        keys.iter()
                            .map(|k| record.get(k).cloned().unwrap_or_default())
                            .collect()
                    }
                    // A bare value fills a single-key record.
                    Sample::Text(s) if keys.len() == 1 => vec![s.clone()],
                    _ => return Err(mismatch()),
                };
                write_info(vec, keys, current, labels, values)?;
            }
            Self::Enum { vec, label, states } => {
                let Sample::Text(state) = sample else {
                    return Err(mismatch());
                };
                if !states.contains(state) {
                    return Err(InstrumentError::UnknownState(state.clone()));
                }
                for candidate in states {
                    let mut all = labels.to_vec();
                    all.push((label.clone(), candidate.clone()));
                    let value = if candidate == state { 1.0 } else { 0.0 };
                    vec.get_metric_with(&label_map(&all))?.set(value);
                }
            }
        }
        Ok(())
    }

    /// Remove every series whose labels include all of `fixed`.
    ///
    /// Returns the number of series removed.
    pub(crate) fn forget(&self, fixed: &[(String, String)]) -> usize {
        match self {
            Self::Gauge(vec) | Self::Enum { vec, .. } => remove_matching(vec, fixed),
            Self::Counter(vec) => remove_matching(vec, fixed),
            Self::Histogram(vec) => remove_matching(vec, fixed),
            Self::Summary { sum, count } => {
                remove_matching(sum, fixed) + remove_matching(count, fixed)
            }
            Self::Info { vec, current, .. } => {
                let prefix: Vec<&str> = fixed.iter().map(|(_, v)| v.as_str()).collect();
                current
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|base, _| {
                        base.len() < prefix.len()
                            || base.iter().zip(&prefix).any(|(have, want)| have != want)
                    });
                remove_matching(vec, fixed)
            }
        }
    }
}

fn remove_matching<T: MetricVecBuilder>(vec: &MetricVec<T>, fixed: &[(String, String)]) -> usize {
    let mut removed = 0;
    for family in vec.collect() {
        for metric in family.get_metric() {
            let pairs: HashMap<&str, &str> = metric
                .get_label()
                .iter()
                .map(|l| (l.get_name(), l.get_value()))
                .collect();
            let matches = fixed
                .iter()
                .all(|(name, value)| pairs.get(name.as_str()) == Some(&value.as_str()));
            if matches && vec.remove(&pairs).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

fn write_info(
    vec: &GaugeVec,
    keys: &[String],
    current: &Mutex<HashMap<Vec<String>, Vec<String>>>,
    labels: &[(String, String)],
    values: Vec<String>,
) -> Result<(), InstrumentError> {
    let with_record = |record: &[String]| {
        let mut all = labels.to_vec();
        all.extend(keys.iter().cloned().zip(record.iter().cloned()));
        all
    };

    let base: Vec<String> = labels.iter().map(|(_, v)| v.clone()).collect();
    let mut current = current.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(previous) = current.get(&base)
        && *previous != values
    {
        // The previous series may already be gone.
        let _ = vec.remove(&label_map(&with_record(previous)));
    }

    vec.get_metric_with(&label_map(&with_record(&values)))?
        .set(1.0);
    current.insert(base, values);
    Ok(())
}
