use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::ImpactError;

const FORECAST_FORMAT: &str = "%Y%m%d%H%M%S";
const FORECAST_FORMAT_SQL: &str = "%Y-%m-%d %H:%M:%S";

/// Wind thresholds in knots, ordered by severity.
pub const WIND_THRESHOLDS: [u16; 8] = [34, 40, 50, 64, 83, 96, 113, 137];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StormId(String);

impl StormId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StormId {
    type Err = ImpactError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !is_valid {
            return Err(ImpactError::InvalidStormId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for StormId {
    type Error = ImpactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StormId> for String {
    fn from(value: StormId) -> Self {
        value.0
    }
}

/// Forecast issue time. Displays as `YYYYMMDDHHMMSS`, which is also the form
/// used in storage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ForecastTime(NaiveDateTime);

impl ForecastTime {
    pub fn new(value: NaiveDateTime) -> Self {
        Self(value)
    }

    pub fn as_datetime(&self) -> NaiveDateTime {
        self.0
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }

    pub fn plus_hours(&self, hours: i64) -> NaiveDateTime {
        self.0 + Duration::hours(hours)
    }

    pub fn to_sql(&self) -> String {
        self.0.format(FORECAST_FORMAT_SQL).to_string()
    }

    /// Human form used in reports, e.g. `November 10, 2025 00:00 UTC`.
    pub fn to_human(&self) -> String {
        human_time(self.0)
    }
}

pub fn human_time(value: NaiveDateTime) -> String {
    value.format("%B %d, %Y %H:%M UTC").to_string()
}

impl fmt::Display for ForecastTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(FORECAST_FORMAT))
    }
}

impl FromStr for ForecastTime {
    type Err = ImpactError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        NaiveDateTime::parse_from_str(trimmed, FORECAST_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(trimmed, FORECAST_FORMAT_SQL))
            .map(Self)
            .map_err(|_| ImpactError::InvalidForecastTime(value.to_string()))
    }
}

impl TryFrom<String> for ForecastTime {
    type Error = ImpactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ForecastTime> for String {
    fn from(value: ForecastTime) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

impl CountryCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CountryCode {
    type Err = ImpactError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid =
            normalized.len() == 3 && normalized.chars().all(|ch| ch.is_ascii_alphabetic());
        if !is_valid {
            return Err(ImpactError::InvalidCountryCode(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for CountryCode {
    type Error = ImpactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CountryCode> for String {
    fn from(value: CountryCode) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct WindThreshold(u16);

impl WindThreshold {
    pub fn knots(&self) -> u16 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = WindThreshold> {
        WIND_THRESHOLDS.iter().map(|knots| WindThreshold(*knots))
    }

    pub fn category(&self) -> &'static str {
        match self.0 {
            34 => "Tropical Storm",
            40 => "Strong Tropical Storm",
            50 => "Very Strong TS",
            64 => "Cat 1 Hurricane",
            83 => "Cat 2 Hurricane",
            96 => "Cat 3 Hurricane",
            113 => "Cat 4 Hurricane",
            _ => "Cat 5 Hurricane",
        }
    }

    /// Position in the severity order, starting at 1 for 34 kt.
    pub fn ordinal(&self) -> usize {
        WIND_THRESHOLDS
            .iter()
            .position(|knots| *knots == self.0)
            .map(|idx| idx + 1)
            .unwrap_or(0)
    }
}

impl fmt::Display for WindThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for WindThreshold {
    type Error = ImpactError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if WIND_THRESHOLDS.contains(&value) {
            Ok(Self(value))
        } else {
            Err(ImpactError::InvalidWindThreshold(value.to_string()))
        }
    }
}

impl From<WindThreshold> for u16 {
    fn from(value: WindThreshold) -> Self {
        value.0
    }
}

impl FromStr for WindThreshold {
    type Err = ImpactError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let knots = value
            .trim()
            .parse::<u16>()
            .map_err(|_| ImpactError::InvalidWindThreshold(value.to_string()))?;
        Self::try_from(knots)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityKind {
    School,
    HealthCenter,
}

impl FacilityKind {
    pub fn all() -> [FacilityKind; 2] {
        [FacilityKind::School, FacilityKind::HealthCenter]
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            FacilityKind::School => "schools",
            FacilityKind::HealthCenter => "health_centers",
        }
    }
}

impl fmt::Display for FacilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacilityKind::School => write!(f, "school"),
            FacilityKind::HealthCenter => write!(f, "health_center"),
        }
    }
}

impl FromStr for FacilityKind {
    type Err = ImpactError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "school" | "schools" => Ok(FacilityKind::School),
            "health_center" | "health_centers" | "hc" => Ok(FacilityKind::HealthCenter),
            _ => Err(ImpactError::InvalidFacilityKind(value.to_string())),
        }
    }
}

/// One unit of work: a single storm forecast evaluated for one country.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub storm: StormId,
    pub forecast_time: ForecastTime,
    pub country: CountryCode,
}

impl UnitKey {
    pub fn new(storm: StormId, forecast_time: ForecastTime, country: CountryCode) -> Self {
        Self {
            storm,
            forecast_time,
            country,
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.storm, self.forecast_time, self.country)
    }
}

/// A storm forecast advertised by the storm source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForecastRef {
    pub storm: StormId,
    pub forecast_time: ForecastTime,
}
