use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt::Debug};

use crate::{
    error::{FetchError, PipelineError, ResolutionError},
    geocode::CoordinateResolver,
    model::{CityCoordinate, DateRange, Mode},
};

pub mod openmeteo;

/// Hourly variables requested from the provider, in request order.
pub const HOURLY_VARIABLES: &[&str] = &[
    "temperature_2m",
    "relativehumidity_2m",
    "precipitation",
    "weathercode",
    "windspeed_10m",
    "winddirection_10m",
];

/// Parallel hourly arrays keyed by provider field name (`time`, `temperature_2m`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSeries {
    pub columns: BTreeMap<String, Vec<Value>>,
}

impl RawSeries {
    pub fn get(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Number of hours, taken from the `time` series.
    pub fn len(&self) -> usize {
        self.get("time").map_or(0, <[Value]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything in a provider response besides the hourly arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub city_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    pub hourly_units: BTreeMap<String, String>,
}

/// Response body shape shared by the archive and forecast endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RawResponse {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub hourly_units: BTreeMap<String, String>,
    pub hourly: RawSeries,
}

impl RawResponse {
    pub fn into_parts(self, city_name: &str) -> (RawSeries, Metadata) {
        let metadata = Metadata {
            city_name: city_name.to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
            timezone: self.timezone,
            hourly_units: self.hourly_units,
        };
        (self.hourly, metadata)
    }
}

/// HTTP boundary to a weather data provider.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    /// Fetch the hourly series around a coordinate.
    ///
    /// `range` may only be `None` for [`Mode::Forecast`], where the provider
    /// falls back to its default horizon.
    async fn hourly(
        &self,
        coordinate: &CityCoordinate,
        mode: Mode,
        range: Option<DateRange>,
    ) -> Result<RawResponse, FetchError>;
}

/// Coordinate resolution followed by one provider request.
#[derive(Debug, Clone, Copy)]
pub struct WeatherFetcher<'a> {
    resolver: &'a CoordinateResolver,
    provider: &'a dyn WeatherProvider,
}

impl<'a> WeatherFetcher<'a> {
    pub fn new(resolver: &'a CoordinateResolver, provider: &'a dyn WeatherProvider) -> Self {
        Self { resolver, provider }
    }

    /// Coordinates of a city through the run's cache.
    pub async fn resolve(&self, city_name: &str) -> Result<CityCoordinate, ResolutionError> {
        self.resolver.resolve(city_name).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn fetch(
        &self,
        city_name: &str,
        range: Option<DateRange>,
        mode: Mode,
    ) -> Result<(RawSeries, Metadata), PipelineError> {
        if mode == Mode::Observation && range.is_none() {
            return Err(FetchError::MissingDateRange {
                city: city_name.to_string(),
            }
            .into());
        }

        let coordinate = self.resolver.resolve(city_name).await?;
        let response = self.provider.hourly(&coordinate, mode, range).await?;
        let (series, metadata) = response.into_parts(city_name);

        tracing::debug!(
            hours = series.len(),
            timezone = %metadata.timezone,
            latitude = metadata.latitude,
            longitude = metadata.longitude,
            "Fetched hourly series"
        );

        Ok((series, metadata))
    }
}
