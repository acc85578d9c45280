//! Core routine traits and types.

use std::time::Duration;

use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use crate::device::DeviceError;

/// Minimum allowed interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that can occur while running routines.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Discovery or device transport failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Push transport failure.
    #[error("push failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Push gateway answered with a non-success status.
    #[error("push gateway rejected the push with status {status}: {body}")]
    PushRejected { status: u16, body: String },

    /// Metrics backend failure (registration or encoding).
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Fixed-interval schedule of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    period: Duration,
}

impl Schedule {
    /// Create an interval schedule.
    ///
    /// Interval is clamped to a minimum of 1 second.
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            Self {
                period: MIN_INTERVAL,
            }
        } else {
            Self { period: duration }
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "every {}", humantime::format_duration(self.period))
    }
}

/// Outcome of one tick, used as the `status` label of the tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum TickStatus {
    Success,
    Failed,
    /// The previous tick of the same routine was still running.
    Skipped,
}

/// A background loop body run on a fixed schedule.
///
/// Routines communicate only through shared state (the device registry and
/// the metrics registry); they never call each other.
///
/// # Error Handling
///
/// A returned error marks the tick as failed and is logged; the routine
/// keeps running on its next tick. Per-device failures are handled inside
/// the tick and do not make it fail.
#[async_trait::async_trait]
pub trait Routine: Send + Sync + 'static {
    /// Unique name, used in logs and self-metrics.
    fn name(&self) -> &str;

    /// Execution schedule.
    fn schedule(&self) -> Schedule;

    /// Perform one tick.
    async fn tick(&self) -> Result<(), CollectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_interval_minimum() {
        let schedule = Schedule::interval(Duration::from_millis(100));
        assert_eq!(schedule.period(), MIN_INTERVAL);
    }

    #[test]
    fn test_schedule_interval_valid() {
        let schedule = Schedule::interval(Duration::from_secs(30));
        assert_eq!(schedule.period(), Duration::from_secs(30));
        assert_eq!(schedule.to_string(), "every 30s");
    }

    #[test]
    fn test_tick_status_labels() {
        assert_eq!(TickStatus::Success.as_ref(), "success");
        assert_eq!(TickStatus::Skipped.to_string(), "skipped");
    }
}
