//! Time-of-use tariff calculation.
//!
//! Maps a point in time to a tariff season and a rate bracket, and prices
//! instantaneous consumption. Used by the metric catalog as a value and
//! label source.
//!
//! - [`TariffConfig`]: immutable season/bracket table (YAML or built-in)
//! - [`TimeOfUseCalculator`]: pure lookups over a validated table

mod calculator;
mod config;

pub use calculator::{RateBracket, TimeOfUseCalculator};
pub use config::{
    BracketConfig, DEFAULT_FALLBACK_BRACKET, DEFAULT_TIMEZONE, HourMinute, MonthDay,
    SeasonConfig, TariffConfig, parse_timezone,
};

use thiserror::Error;

/// Errors raised while loading or querying a tariff table.
#[derive(Debug, Error)]
pub enum TariffError {
    /// Failed to read the tariff file.
    #[error("failed to read tariff file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the tariff YAML.
    #[error("failed to parse tariff YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Malformed `MM-DD` value.
    #[error("invalid month-day '{0}', expected MM-DD")]
    InvalidMonthDay(String),

    /// Malformed `HH:MM` value.
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),

    /// Unknown IANA zone name.
    #[error("unknown time zone '{0}', expected an IANA name such as America/Denver")]
    InvalidTimezone(String),

    /// Lookup against a season that is not in the table.
    #[error("unknown season '{0}'")]
    UnknownSeason(String),

    /// Table is structurally invalid.
    #[error("tariff validation error: {0}")]
    Validation(String),
}
