//! City name to coordinate resolution.
//!
//! [`NominatimGeocoder`] queries the OpenStreetMap search API; the
//! [`CoordinateResolver`] rounds its answer and remembers it for the rest of
//! the run.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex},
};

use crate::{error::ResolutionError, model::CityCoordinate};

/// Raw answer of a geocoding backend, before rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait Geocoder: Send + Sync + Debug {
    /// Look up a free-text place name. `Ok(None)` means the backend had no match.
    async fn geocode(&self, query: &str) -> Result<Option<GeoPoint>, ResolutionError>;
}

#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    base_url: String,
    http: Client,
}

impl NominatimGeocoder {
    pub fn new(base_url: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<GeoPoint>, ResolutionError> {
        tracing::debug!(query, "Geocoding city");

        let res = self
            .http
            .get(&self.base_url)
            .query(&[("q", query), ("format", "jsonv2"), ("limit", "1")])
            .send()
            .await
            .map_err(|source| ResolutionError::Request {
                city: query.to_string(),
                source,
            })?;

        let status = res.status();
        let body = res.text().await.map_err(|source| ResolutionError::Request {
            city: query.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(ResolutionError::Status {
                city: query.to_string(),
                status,
                body: truncate_body(&body),
            });
        }

        parse_places(query, &body)
    }
}

fn parse_places(query: &str, body: &str) -> Result<Option<GeoPoint>, ResolutionError> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).map_err(|e| ResolutionError::Parse {
            city: query.to_string(),
            message: e.to_string(),
        })?;

    let Some(first) = places.first() else {
        return Ok(None);
    };

    let parse = |field: &str, raw: &str| {
        raw.parse::<f64>().map_err(|_| ResolutionError::Parse {
            city: query.to_string(),
            message: format!("{field} '{raw}' is not a number"),
        })
    };

    Ok(Some(GeoPoint {
        latitude: parse("lat", &first.lat)?,
        longitude: parse("lon", &first.lon)?,
    }))
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Configured names use `_` for spaces ("New_York"); the geocoder wants words.
pub fn geocoder_query(city_name: &str) -> String {
    city_name.replace('_', " ")
}

/// Resolves cities through a [`Geocoder`] and caches the rounded result.
///
/// One resolver belongs to one pipeline run; dropping it drops the cache.
#[derive(Debug)]
pub struct CoordinateResolver {
    geocoder: Arc<dyn Geocoder>,
    cache: Mutex<HashMap<String, CityCoordinate>>,
}

impl CoordinateResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self {
            geocoder,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, city_name: &str) -> Result<CityCoordinate, ResolutionError> {
        if let Some(hit) = self.cached(city_name) {
            return Ok(hit);
        }

        let point = self
            .geocoder
            .geocode(&geocoder_query(city_name))
            .await?
            .ok_or_else(|| ResolutionError::NotFound {
                city: city_name.to_string(),
            })?;

        let coordinate = CityCoordinate {
            city_name: city_name.to_string(),
            latitude: round2(point.latitude),
            longitude: round2(point.longitude),
        };
        tracing::debug!(
            city = city_name,
            latitude = coordinate.latitude,
            longitude = coordinate.longitude,
            "Resolved city"
        );

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(city_name.to_string(), coordinate.clone());
        }
        Ok(coordinate)
    }

    fn cached(&self, city_name: &str) -> Option<CityCoordinate> {
        self.cache.lock().ok()?.get(city_name).cloned()
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
