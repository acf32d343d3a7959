//! Provider series to canonical [`WeatherRecord`]s.

use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::HashSet;

use crate::{
    error::NormalizationError,
    model::{Mode, SchemaVariant, WeatherRecord},
    provider::{Metadata, RawSeries},
};

const TIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Provider field name and the canonical column it becomes.
pub const FIELD_RENAMES: &[(&str, &str)] = &[
    ("time", "base_time"),
    ("temperature_2m", "temperature"),
    ("relativehumidity_2m", "relative_humidity"),
    ("precipitation", "precipitation"),
    ("weathercode", "weather_code"),
    ("windspeed_10m", "wind_speed"),
    ("winddirection_10m", "wind_direction"),
];

fn provider_name(canonical: &str) -> &str {
    FIELD_RENAMES
        .iter()
        .find(|(_, to)| *to == canonical)
        .map_or(canonical, |(from, _)| *from)
}

/// Milliseconds since the epoch, reading `base_time` as UTC.
pub fn unix_millis(base_time: NaiveDateTime) -> i64 {
    base_time.and_utc().timestamp_millis()
}

pub fn parse_base_time(raw: &str) -> Option<NaiveDateTime> {
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Column view that checks length and cell types against one city's response.
struct Columns<'a> {
    series: &'a RawSeries,
    city: &'a str,
    rows: usize,
}

impl<'a> Columns<'a> {
    fn column(&self, canonical: &str) -> Result<&'a [Value], NormalizationError> {
        let name = provider_name(canonical);
        let values = self
            .series
            .get(name)
            .ok_or_else(|| NormalizationError::MissingColumn {
                city: self.city.to_string(),
                column: name.to_string(),
            })?;

        if values.len() != self.rows {
            return Err(NormalizationError::LengthMismatch {
                city: self.city.to_string(),
                column: name.to_string(),
                expected: self.rows,
                found: values.len(),
            });
        }
        Ok(values)
    }

    fn optional(&self, canonical: &str, wanted: bool) -> Result<Option<&'a [Value]>, NormalizationError> {
        if wanted {
            self.column(canonical).map(Some)
        } else {
            Ok(None)
        }
    }

    fn invalid(&self, canonical: &str, row: usize, value: &Value) -> NormalizationError {
        NormalizationError::InvalidValue {
            city: self.city.to_string(),
            column: provider_name(canonical).to_string(),
            row,
            value: value.to_string(),
        }
    }

    fn float(&self, canonical: &str, values: &[Value], row: usize) -> Result<Option<f64>, NormalizationError> {
        match &values[row] {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(canonical, row, &values[row])),
            other => Err(self.invalid(canonical, row, other)),
        }
    }

    fn code(&self, canonical: &str, values: &[Value], row: usize) -> Result<Option<i64>, NormalizationError> {
        match &values[row] {
            Value::Null => Ok(None),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(code), _) => Ok(Some(code)),
                (None, Some(f)) if f.fract() == 0.0 => Ok(Some(f as i64)),
                _ => Err(self.invalid(canonical, row, &values[row])),
            },
            other => Err(self.invalid(canonical, row, other)),
        }
    }
}

/// Reshape one city's response into records of the variant's schema.
///
/// `forecast_hr` is 0 for observations and the row index for forecasts.
/// Fields outside the schema are dropped. The result depends only on the
/// arguments.
pub fn normalize(
    series: &RawSeries,
    metadata: &Metadata,
    mode: Mode,
    variant: SchemaVariant,
) -> Result<Vec<WeatherRecord>, NormalizationError> {
    let city = metadata.city_name.as_str();

    let time = series
        .get("time")
        .ok_or_else(|| NormalizationError::MissingColumn {
            city: city.to_string(),
            column: "time".to_string(),
        })?;
    if time.is_empty() {
        return Err(NormalizationError::Empty {
            city: city.to_string(),
        });
    }

    let cols = Columns {
        series,
        city,
        rows: time.len(),
    };
    let temperature = cols.column("temperature")?;
    let humidity = cols.column("relative_humidity")?;
    let precipitation = cols.optional("precipitation", variant.includes_precipitation())?;
    let weather_code = cols.column("weather_code")?;
    let wind_speed = cols.column("wind_speed")?;
    let wind_direction = cols.column("wind_direction")?;

    let mut seen = HashSet::with_capacity(time.len());
    let mut records = Vec::with_capacity(time.len());

    for (row, raw_time) in time.iter().enumerate() {
        let base_time = raw_time
            .as_str()
            .and_then(parse_base_time)
            .ok_or_else(|| NormalizationError::InvalidTime {
                city: city.to_string(),
                value: raw_time.to_string(),
            })?;

        let forecast_hr = match mode {
            Mode::Observation => 0,
            Mode::Forecast => row as u32,
        };

        if !seen.insert((base_time, forecast_hr)) {
            return Err(NormalizationError::DuplicateKey {
                city: city.to_string(),
                base_time: base_time.to_string(),
                forecast_hr,
            });
        }

        records.push(WeatherRecord {
            city_name: city.to_string(),
            base_time,
            forecast_hr,
            temperature: cols.float("temperature", temperature, row)?,
            relative_humidity: cols.float("relative_humidity", humidity, row)?,
            precipitation: match precipitation {
                Some(values) => cols.float("precipitation", values, row)?,
                None => None,
            },
            weather_code: cols.code("weather_code", weather_code, row)?,
            wind_speed: cols.float("wind_speed", wind_speed, row)?,
            wind_direction: cols.float("wind_direction", wind_direction, row)?,
            unix_time: variant.includes_unix_time().then(|| unix_millis(base_time)),
        });
    }

    Ok(records)
}
