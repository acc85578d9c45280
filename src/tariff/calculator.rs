//! Season and rate lookups over a validated tariff table.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use super::TariffError;
use super::config::{BracketConfig, HourMinute, MonthDay, SeasonConfig, TariffConfig};

/// Watts per kilowatt.
const WATTS_PER_KW: f64 = 1000.0;

/// A matched bracket: its name and price per kWh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBracket<'a> {
    pub name: &'a str,
    pub rate: f64,
}

impl<'a> From<&'a BracketConfig> for RateBracket<'a> {
    fn from(bracket: &'a BracketConfig) -> Self {
        Self {
            name: &bracket.name,
            rate: bracket.rate,
        }
    }
}

/// Time-of-use calculator.
///
/// Holds only the immutable table; every lookup is a pure read, so a single
/// instance is shared across tasks behind an `Arc`.
#[derive(Debug, Clone)]
pub struct TimeOfUseCalculator {
    config: TariffConfig,
    tz: Tz,
    default_season: usize,
}

impl TimeOfUseCalculator {
    /// Build a calculator from a table, validating it first.
    ///
    /// # Errors
    /// Returns `TariffError` if the table fails validation.
    pub fn new(config: TariffConfig) -> Result<Self, TariffError> {
        config.validate()?;
        let tz = config.tz()?;
        let default_season = config
            .seasons
            .iter()
            .position(|s| s.name == config.default_season)
            .ok_or_else(|| TariffError::UnknownSeason(config.default_season.clone()))?;

        Ok(Self {
            config,
            tz,
            default_season,
        })
    }

    /// The table this calculator was built from.
    pub fn config(&self) -> &TariffConfig {
        &self.config
    }

    /// Zone in which seasons and brackets are resolved.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Wall-clock time of `at` in the tariff zone.
    pub fn local_time(&self, at: DateTime<Utc>) -> DateTime<Tz> {
        at.with_timezone(&self.tz)
    }

    /// Season name for a calendar date. Falls back to the default season.
    pub fn current_season(&self, date: NaiveDate) -> &str {
        &self.season_for(date).name
    }

    /// Season name for "now" in the tariff zone.
    pub fn season_now(&self) -> &str {
        self.current_season(self.local_time(Utc::now()).date_naive())
    }

    /// Bracket for a wall-clock time within a named season.
    ///
    /// Windows are tested in declaration order, first match wins; no match
    /// yields the fallback bracket.
    ///
    /// # Errors
    /// Returns `TariffError::UnknownSeason` if `season` is not in the table.
    pub fn bracket_for_time(
        &self,
        time: NaiveTime,
        season: &str,
    ) -> Result<RateBracket<'_>, TariffError> {
        let season = self
            .config
            .seasons
            .iter()
            .find(|s| s.name == season)
            .ok_or_else(|| TariffError::UnknownSeason(season.to_string()))?;
        Ok(self.bracket_in(season, time))
    }

    /// Rate for a wall-clock time within a named season.
    pub fn rate_for_time(&self, time: NaiveTime, season: &str) -> Result<f64, TariffError> {
        self.bracket_for_time(time, season).map(|b| b.rate)
    }

    /// Bracket in effect at an instant, resolved in the tariff zone.
    pub fn bracket_at(&self, at: DateTime<Utc>) -> RateBracket<'_> {
        let local = self.local_time(at);
        let season = self.season_for(local.date_naive());
        self.bracket_in(season, local.time())
    }

    /// Cost per hour of drawing `watts` at instant `at`.
    pub fn cost_for_usage_at(&self, watts: f64, at: DateTime<Utc>) -> f64 {
        (watts / WATTS_PER_KW) * self.bracket_at(at).rate
    }

    /// Cost per hour of drawing `watts` right now.
    pub fn rate_for_current_usage(&self, watts: f64) -> f64 {
        self.cost_for_usage_at(watts, Utc::now())
    }

    fn season_for(&self, date: NaiveDate) -> &SeasonConfig {
        let today = MonthDay {
            month: date.month(),
            day: date.day(),
        };
        self.config
            .seasons
            .iter()
            .find(|s| s.contains(today))
            .unwrap_or(&self.config.seasons[self.default_season])
    }

    fn bracket_in<'a>(&'a self, season: &'a SeasonConfig, time: NaiveTime) -> RateBracket<'a> {
        let now = HourMinute {
            hour: time.hour(),
            minute: time.minute(),
        };

        season
            .brackets
            .iter()
            .find(|b| b.windows.iter().any(|(start, end)| *start <= now && now <= *end))
            .or_else(|| {
                season
                    .brackets
                    .iter()
                    .find(|b| b.name == self.config.fallback_bracket)
            })
            .map(RateBracket::from)
            // validate() guarantees the fallback bracket exists in every season
            .unwrap_or(RateBracket {
                name: &self.config.fallback_bracket,
                rate: 0.0,
            })
    }
}
