//! Metric catalogs for the supported device kinds.

use std::sync::Arc;

use chrono::Utc;

use super::simulated::SIMULATED_STATUSES;
use super::{Device, Reading};
use crate::metrics::{Catalog, DimensionSpec, ExtractError, MetricSpec, Sample};
use crate::tariff::TimeOfUseCalculator;

/// Seconds per hour.
const SECS_PER_HOUR: f64 = 3600.0;

// =============================================================================
// Accessor helpers
// =============================================================================

fn number(device: &dyn Device, feature: &str) -> Result<Option<f64>, ExtractError> {
    match device.feature(feature) {
        None => Ok(None),
        Some(reading) => reading.as_f64().map(Some).ok_or(ExtractError::UnexpectedType {
            feature: feature.to_string(),
            expected: "number",
        }),
    }
}

fn flag(device: &dyn Device, feature: &str) -> Result<Option<bool>, ExtractError> {
    match device.feature(feature) {
        None => Ok(None),
        Some(reading) => reading.as_bool().map(Some).ok_or(ExtractError::UnexpectedType {
            feature: feature.to_string(),
            expected: "flag",
        }),
    }
}

/// Gauge of a numeric feature.
fn numeric_gauge(feature: &'static str, help: &str) -> MetricSpec {
    MetricSpec::gauge()
        .with_help(help)
        .with_value(move |d| Ok(number(d, feature)?.map(Sample::from)))
}

/// Two-state enum over a boolean feature.
fn flag_enum(feature: &'static str, on: &'static str, off: &'static str, help: &str) -> MetricSpec {
    MetricSpec::enumeration([on, off])
        .with_help(help)
        .with_value(move |d| Ok(flag(d, feature)?.map(|f| Sample::from(if f { on } else { off }))))
}

/// Single-key info metric over any feature, rendered as text.
fn text_info(feature: &'static str, help: &str) -> MetricSpec {
    MetricSpec::info([feature])
        .with_help(help)
        .with_value(move |d| Ok(d.feature(feature).map(|r| Sample::info([(feature, r.to_string())]))))
}

// =============================================================================
// Smart plug
// =============================================================================

/// Fixed labels of every smart-plug metric.
pub fn smart_plug_dimensions() -> DimensionSpec {
    DimensionSpec::new()
        .attribute("device_id")
        .attribute("alias")
        .attribute("model")
}

/// Smart-plug catalog. `consumption_cost` prices the current draw with `tariff`.
pub fn smart_plug_catalog(tariff: Arc<TimeOfUseCalculator>) -> Catalog {
    let season_tariff = Arc::clone(&tariff);
    let class_tariff = Arc::clone(&tariff);

    Catalog::new()
        .with("signal_level", numeric_gauge("signal_level", "Wi-Fi signal level"))
        .with("state", flag_enum("state", "on", "off", "Relay state"))
        .with("rssi", numeric_gauge("rssi", "Wi-Fi RSSI in dBm"))
        .with("ssid", text_info("ssid", "Connected network"))
        .with(
            "on_since",
            MetricSpec::gauge()
                .with_help("Hours since the relay was switched on")
                .with_value(|d| match d.feature("on_since") {
                    None => Ok(None),
                    Some(Reading::Timestamp(since)) => {
                        let secs = (Utc::now() - since).num_milliseconds() as f64 / 1000.0;
                        Ok(Some(Sample::from(secs / SECS_PER_HOUR)))
                    }
                    Some(_) => Err(ExtractError::UnexpectedType {
                        feature: "on_since".to_string(),
                        expected: "timestamp",
                    }),
                }),
        )
        .with(
            "auto_off_enabled",
            flag_enum("auto_off_enabled", "enabled", "disabled", "Auto-off timer"),
        )
        .with(
            "auto_off_minutes",
            numeric_gauge("auto_off_minutes", "Auto-off delay in minutes"),
        )
        .with("auto_off_at", text_info("auto_off_at", "Scheduled auto-off time"))
        .with(
            "cloud_connection",
            flag_enum("cloud_connection", "connected", "disconnected", "Cloud connection"),
        )
        .with(
            "current_consumption",
            numeric_gauge("current_consumption", "Current power draw in watts"),
        )
        .with("voltage", numeric_gauge("voltage", "Supply voltage in volts"))
        .with("current", numeric_gauge("current", "Load current in amperes"))
        .with(
            "consumption_today",
            numeric_gauge("consumption_today", "Energy used today in kWh"),
        )
        .with(
            "consumption_this_month",
            MetricSpec::histogram()
                .with_help("Energy used this month in kWh")
                .with_value(|d| Ok(number(d, "consumption_this_month")?.map(Sample::from))),
        )
        .with(
            "consumption_total",
            numeric_gauge("consumption_total", "Lifetime energy in kWh"),
        )
        .with(
            "update_available",
            flag_enum("update_available", "available", "not_available", "Firmware update availability"),
        )
        .with(
            "current_firmware_version",
            text_info("current_firmware_version", "Installed firmware"),
        )
        .with(
            "available_firmware_version",
            text_info("available_firmware_version", "Latest available firmware"),
        )
        .with("led", flag_enum("led", "on", "off", "Status LED"))
        .with(
            "consumption_cost",
            MetricSpec::gauge()
                .with_help("Cost per hour of the current draw at the active rate")
                .with_value(move |d| {
                    Ok(number(d, "current_consumption")?
                        .map(|watts| Sample::from(tariff.rate_for_current_usage(watts))))
                })
                .with_derived_label("season", move |_| Ok(season_tariff.season_now().to_string()))
                .with_derived_label("rate_class", move |_| {
                    Ok(class_tariff.bracket_at(Utc::now()).name.to_string())
                }),
        )
}

// =============================================================================
// Simulated device
// =============================================================================

/// Fixed labels of every simulated-device metric.
pub fn simulated_dimensions() -> DimensionSpec {
    DimensionSpec::new()
        .attribute("device_id")
        .attribute("location")
}

/// Catalog exercising every metric kind against simulated devices.
pub fn simulated_catalog() -> Catalog {
    Catalog::new()
        .with("temperature", MetricSpec::gauge().with_help("Temperature in degrees Celsius"))
        .with("errors", MetricSpec::counter().with_help("Errors since the last refresh"))
        .with("latency", MetricSpec::summary().with_help("Latency in seconds"))
        .with(
            "response_time",
            MetricSpec::histogram()
                .with_help("Response time in seconds")
                .with_buckets(vec![0.25, 0.5, 1.0, 1.5, 2.0]),
        )
        .with(
            "version",
            MetricSpec::info(["version", "buildhost"])
                .with_help("Build information")
                .with_value(|d| {
                    Ok(d.feature("version").and_then(|v| {
                        v.as_str()
                            .map(|version| Sample::info([("version", version), ("buildhost", "localhost")]))
                    }))
                }),
        )
        .with(
            "status",
            MetricSpec::enumeration(SIMULATED_STATUSES).with_help("Lifecycle status"),
        )
}
