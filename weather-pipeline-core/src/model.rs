use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{convert::TryFrom, fmt};

/// Layout used when a timestamp is written as a table cell.
pub const BASE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which provider endpoint a batch is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Observation,
    Forecast,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Observation => "observation",
            Mode::Forecast => "forecast",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Column layout contract with the feature group.
///
/// `Basic` omits `precipitation` and `unix_time` and looks six days ahead for
/// forecasts; `Extended` carries both columns and looks seven days ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVariant {
    Basic,
    #[default]
    Extended,
}

const BASIC_COLUMNS: &[&str] = &[
    "city_name",
    "base_time",
    "forecast_hr",
    "temperature",
    "relative_humidity",
    "weather_code",
    "wind_speed",
    "wind_direction",
];

const EXTENDED_COLUMNS: &[&str] = &[
    "city_name",
    "base_time",
    "forecast_hr",
    "temperature",
    "precipitation",
    "relative_humidity",
    "weather_code",
    "wind_speed",
    "wind_direction",
    "unix_time",
];

impl SchemaVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVariant::Basic => "basic",
            SchemaVariant::Extended => "extended",
        }
    }

    pub const fn all() -> &'static [SchemaVariant] {
        &[SchemaVariant::Basic, SchemaVariant::Extended]
    }

    /// Ordered column names of a batch in this variant.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            SchemaVariant::Basic => BASIC_COLUMNS,
            SchemaVariant::Extended => EXTENDED_COLUMNS,
        }
    }

    pub fn includes_precipitation(&self) -> bool {
        matches!(self, SchemaVariant::Extended)
    }

    pub fn includes_unix_time(&self) -> bool {
        matches!(self, SchemaVariant::Extended)
    }

    /// Default distance of the forecast day from the run date.
    pub fn forecast_days_ahead(&self) -> u32 {
        match self {
            SchemaVariant::Basic => 6,
            SchemaVariant::Extended => 7,
        }
    }
}

impl fmt::Display for SchemaVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SchemaVariant {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "basic" => Ok(SchemaVariant::Basic),
            "extended" => Ok(SchemaVariant::Extended),
            _ => Err(anyhow::anyhow!(
                "Unknown schema variant '{value}'. Supported variants: basic, extended."
            )),
        }
    }
}

/// Inclusive range of calendar days sent as `start_date`/`end_date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityCoordinate {
    pub city_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// One hour of weather for one city.
///
/// `precipitation` and `unix_time` stay `None` in the basic variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub city_name: String,
    pub base_time: NaiveDateTime,
    pub forecast_hr: u32,
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub precipitation: Option<f64>,
    pub weather_code: Option<i64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub unix_time: Option<i64>,
}

/// Identity of a record inside a batch and inside a feature group.
pub type RecordKey = (String, NaiveDateTime, u32);

impl WeatherRecord {
    pub fn key(&self) -> RecordKey {
        (self.city_name.clone(), self.base_time, self.forecast_hr)
    }

    /// Cell value for a canonical column name, `None` for unknown columns.
    pub fn cell(&self, column: &str) -> Option<Value> {
        let value = match column {
            "city_name" => Value::from(self.city_name.as_str()),
            "base_time" => Value::from(self.base_time.format(BASE_TIME_FORMAT).to_string()),
            "forecast_hr" => Value::from(self.forecast_hr),
            "temperature" => opt(self.temperature),
            "relative_humidity" => opt(self.relative_humidity),
            "precipitation" => opt(self.precipitation),
            "weather_code" => opt(self.weather_code),
            "wind_speed" => opt(self.wind_speed),
            "wind_direction" => opt(self.wind_direction),
            "unix_time" => opt(self.unix_time),
            _ => return None,
        };
        Some(value)
    }

    /// The record projected onto the variant's column order.
    pub fn to_row(&self, variant: SchemaVariant) -> Vec<Value> {
        variant
            .columns()
            .iter()
            .map(|c| self.cell(c).unwrap_or(Value::Null))
            .collect()
    }
}

fn opt<T: Into<Value>>(v: Option<T>) -> Value {
    v.map(Into::into).unwrap_or(Value::Null)
}

/// Records for one mode and one date window, in configured city order.
///
/// Only the assembler builds batches; once built they are read-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    mode: Mode,
    variant: SchemaVariant,
    range: Option<DateRange>,
    records: Vec<WeatherRecord>,
}

impl Batch {
    pub(crate) fn new(
        mode: Mode,
        variant: SchemaVariant,
        range: Option<DateRange>,
        records: Vec<WeatherRecord>,
    ) -> Self {
        Self {
            mode,
            variant,
            range,
            records,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn variant(&self) -> SchemaVariant {
        self.variant
    }

    pub fn range(&self) -> Option<DateRange> {
        self.range
    }

    pub fn columns(&self) -> &'static [&'static str] {
        self.variant.columns()
    }

    pub fn records(&self) -> &[WeatherRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows in column order, ready for a tabular sink.
    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.records.iter().map(|r| r.to_row(self.variant)).collect()
    }

    /// Distinct city names in first-seen order.
    pub fn cities(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for r in &self.records {
            if !out.contains(&r.city_name.as_str()) {
                out.push(r.city_name.as_str());
            }
        }
        out
    }
}
