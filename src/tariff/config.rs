//! Time-of-use tariff table.
//!
//! The table is loaded once at startup (YAML file or the built-in default) and
//! never mutated afterwards. Seasons and brackets keep their declaration order
//! because matching is first-match-wins.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::TariffError;

/// Bracket used when no window of a season matches.
pub const DEFAULT_FALLBACK_BRACKET: &str = "off_peak";

/// Zone used to resolve "now"; daylight-saving transitions follow the zone rules.
pub const DEFAULT_TIMEZONE: &str = "America/Denver";

fn default_fallback_bracket() -> String {
    DEFAULT_FALLBACK_BRACKET.to_string()
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

// =============================================================================
// Calendar primitives
// =============================================================================

/// A calendar day without a year, written `MM-DD`.
///
/// Ordering is (month, day), which is the same order as comparing the
/// zero-padded text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Result<Self, TariffError> {
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(TariffError::InvalidMonthDay(format!("{month:02}-{day:02}")));
        }
        Ok(Self { month, day })
    }
}

impl FromStr for MonthDay {
    type Err = TariffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TariffError::InvalidMonthDay(s.to_string());
        let (month, day) = s.split_once('-').ok_or_else(invalid)?;
        if month.len() != 2 || day.len() != 2 {
            return Err(invalid());
        }
        let month = month.parse().map_err(|_| invalid())?;
        let day = day.parse().map_err(|_| invalid())?;
        Self::new(month, day).map_err(|_| invalid())
    }
}

impl TryFrom<String> for MonthDay {
    type Error = TariffError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthDay> for String {
    fn from(value: MonthDay) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

/// A wall-clock minute, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HourMinute {
    pub hour: u32,
    pub minute: u32,
}

impl HourMinute {
    pub fn new(hour: u32, minute: u32) -> Result<Self, TariffError> {
        if hour > 23 || minute > 59 {
            return Err(TariffError::InvalidTime(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }
}

impl FromStr for HourMinute {
    type Err = TariffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TariffError::InvalidTime(s.to_string());
        let (hour, minute) = s.split_once(':').ok_or_else(invalid)?;
        if hour.len() != 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

impl TryFrom<String> for HourMinute {
    type Error = TariffError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HourMinute> for String {
    fn from(value: HourMinute) -> Self {
        value.to_string()
    }
}

impl fmt::Display for HourMinute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

// =============================================================================
// Table
// =============================================================================

/// A named rate bracket and the daily windows it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketConfig {
    /// Bracket name, e.g. `on_peak`.
    pub name: String,
    /// Price per kWh.
    pub rate: f64,
    /// Inclusive `[start, end]` windows.
    #[serde(default)]
    pub windows: Vec<(HourMinute, HourMinute)>,
}

/// A season: its calendar span and the brackets of its day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonConfig {
    pub name: String,
    /// First day of the season (inclusive).
    pub start: MonthDay,
    /// Last day of the season (inclusive). May precede `start` to wrap the year.
    pub end: MonthDay,
    pub brackets: Vec<BracketConfig>,
}

impl SeasonConfig {
    /// Whether `today` falls in this season's span.
    pub fn contains(&self, today: MonthDay) -> bool {
        if self.start <= self.end {
            self.start <= today && today <= self.end
        } else {
            today >= self.start || today <= self.end
        }
    }
}

/// Complete time-of-use table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffConfig {
    /// Seasons in match order.
    pub seasons: Vec<SeasonConfig>,
    /// Season returned when no span matches.
    pub default_season: String,
    /// Bracket used when no window matches.
    #[serde(default = "default_fallback_bracket")]
    pub fallback_bracket: String,
    /// IANA zone name, e.g. `America/Denver`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl TariffConfig {
    /// Load a tariff table from a YAML file and validate it.
    ///
    /// # Errors
    /// Returns `TariffError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TariffError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate season names, the default season and the fallback bracket.
    pub fn validate(&self) -> Result<(), TariffError> {
        if self.seasons.is_empty() {
            return Err(TariffError::Validation("at least one season is required".into()));
        }

        let mut seen = HashSet::new();
        for season in &self.seasons {
            if season.name.is_empty() {
                return Err(TariffError::Validation("season name cannot be empty".into()));
            }
            if !seen.insert(season.name.as_str()) {
                return Err(TariffError::Validation(format!(
                    "duplicate season: '{}'",
                    season.name
                )));
            }
            if !season
                .brackets
                .iter()
                .any(|b| b.name == self.fallback_bracket)
            {
                return Err(TariffError::Validation(format!(
                    "season '{}' has no '{}' bracket",
                    season.name, self.fallback_bracket
                )));
            }
            if let Some(bracket) = season.brackets.iter().find(|b| !b.rate.is_finite()) {
                return Err(TariffError::Validation(format!(
                    "season '{}' bracket '{}' has a non-finite rate",
                    season.name, bracket.name
                )));
            }
        }

        if !seen.contains(self.default_season.as_str()) {
            return Err(TariffError::Validation(format!(
                "default season '{}' is not declared",
                self.default_season
            )));
        }

        self.tz()?;
        Ok(())
    }

    /// Resolve `timezone` into a zone.
    pub fn tz(&self) -> Result<Tz, TariffError> {
        parse_timezone(&self.timezone)
    }
}

impl Default for TariffConfig {
    /// Two-season residential schedule.
    fn default() -> Self {
        const fn md(month: u32, day: u32) -> MonthDay {
            MonthDay { month, day }
        }
        const fn window(start: (u32, u32), end: (u32, u32)) -> (HourMinute, HourMinute) {
            (
                HourMinute { hour: start.0, minute: start.1 },
                HourMinute { hour: end.0, minute: end.1 },
            )
        }
        fn bracket(name: &str, rate: f64, windows: Vec<(HourMinute, HourMinute)>) -> BracketConfig {
            BracketConfig {
                name: name.to_string(),
                rate,
                windows,
            }
        }

        Self {
            seasons: vec![
                SeasonConfig {
                    name: "summer".to_string(),
                    start: md(6, 1),
                    end: md(9, 30),
                    brackets: vec![
                        bracket(
                            "off_peak",
                            0.11,
                            vec![window((0, 0), (13, 0)), window((19, 0), (0, 0))],
                        ),
                        bracket("mid_peak", 0.19, vec![window((13, 0), (15, 0))]),
                        bracket("on_peak", 0.28, vec![window((15, 0), (19, 0))]),
                    ],
                },
                SeasonConfig {
                    name: "winter".to_string(),
                    start: md(12, 1),
                    end: md(2, 28),
                    brackets: vec![
                        bracket(
                            "off_peak",
                            0.10,
                            vec![window((0, 0), (6, 0)), window((20, 0), (23, 59))],
                        ),
                        bracket(
                            "mid_peak",
                            0.17,
                            vec![window((6, 0), (14, 0)), window((18, 0), (20, 0))],
                        ),
                        bracket("on_peak", 0.25, vec![window((14, 0), (18, 0))]),
                    ],
                },
            ],
            default_season: "summer".to_string(),
            fallback_bracket: default_fallback_bracket(),
            timezone: default_timezone(),
        }
    }
}

/// Parse an IANA zone name such as `America/Denver` or `UTC`.
pub fn parse_timezone(s: &str) -> Result<Tz, TariffError> {
    s.trim()
        .parse::<Tz>()
        .map_err(|_| TariffError::InvalidTimezone(s.to_string()))
}
