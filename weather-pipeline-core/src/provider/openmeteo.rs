use async_trait::async_trait;
use reqwest::Client;

use crate::{
    config::EndpointConfig,
    error::FetchError,
    model::{CityCoordinate, DateRange, Mode},
    provider::{HOURLY_VARIABLES, RawResponse},
};

use super::WeatherProvider;

/// Open-Meteo archive (observations) and forecast endpoints.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    archive_url: String,
    forecast_url: String,
    http: Client,
}

impl OpenMeteoProvider {
    pub fn new(archive_url: impl Into<String>, forecast_url: impl Into<String>, http: Client) -> Self {
        Self {
            archive_url: archive_url.into(),
            forecast_url: forecast_url.into(),
            http,
        }
    }

    pub fn from_endpoints(endpoints: &EndpointConfig, http: Client) -> Self {
        Self::new(&endpoints.archive_url, &endpoints.forecast_url, http)
    }

    fn endpoint(&self, mode: Mode) -> &str {
        match mode {
            Mode::Observation => &self.archive_url,
            Mode::Forecast => &self.forecast_url,
        }
    }
}

/// Query parameters for one request, dates only when a range is given.
fn query_params(coordinate: &CityCoordinate, range: Option<DateRange>) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("latitude", coordinate.latitude.to_string()),
        ("longitude", coordinate.longitude.to_string()),
        ("hourly", HOURLY_VARIABLES.join(",")),
    ];
    if let Some(range) = range {
        params.push(("start_date", range.start.format("%Y-%m-%d").to_string()));
        params.push(("end_date", range.end.format("%Y-%m-%d").to_string()));
    }
    params
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    async fn hourly(
        &self,
        coordinate: &CityCoordinate,
        mode: Mode,
        range: Option<DateRange>,
    ) -> Result<RawResponse, FetchError> {
        let city = coordinate.city_name.as_str();
        let url = self.endpoint(mode);
        tracing::debug!(city, url, %mode, "Requesting Open-Meteo hourly series");

        let res = self
            .http
            .get(url)
            .query(&query_params(coordinate, range))
            .send()
            .await
            .map_err(|source| FetchError::Request {
                city: city.to_string(),
                source,
            })?;

        let status = res.status();
        let body = res.text().await.map_err(|source| FetchError::Request {
            city: city.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(FetchError::Status {
                city: city.to_string(),
                status,
                body: truncate_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|e| FetchError::Malformed {
            city: city.to_string(),
            message: format!("{e} (body: {})", truncate_body(&body)),
        })
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn london() -> CityCoordinate {
        CityCoordinate {
            city_name: "London".into(),
            latitude: 51.51,
            longitude: -0.13,
        }
    }

    fn provider_for(server: &MockServer) -> OpenMeteoProvider {
        OpenMeteoProvider::new(
            format!("{}/v1/archive", server.uri()),
            format!("{}/v1/forecast", server.uri()),
            Client::new(),
        )
    }

    fn body() -> serde_json::Value {
        serde_json::json!({
            "latitude": 51.5,
            "longitude": -0.12,
            "timezone": "GMT",
            "hourly_units": {"time": "iso8601", "temperature_2m": "°C"},
            "hourly": {
                "time": ["2024-01-08T00:00", "2024-01-08T01:00"],
                "temperature_2m": [3.1, 2.9],
                "relativehumidity_2m": [91, 92],
                "precipitation": [0.0, 0.1],
                "weathercode": [3, 61],
                "windspeed_10m": [11.2, 10.8],
                "winddirection_10m": [240, 245]
            }
        })
    }

    #[tokio::test]
    async fn observation_hits_archive_with_dates() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/archive"))
            .and(query_param("latitude", "51.51"))
            .and(query_param("longitude", "-0.13"))
            .and(query_param(
                "hourly",
                "temperature_2m,relativehumidity_2m,precipitation,weathercode,windspeed_10m,winddirection_10m",
            ))
            .and(query_param("start_date", "2024-01-08"))
            .and(query_param("end_date", "2024-01-08"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let day = NaiveDate::from_ymd_opt(2024, 1, 8).expect("valid date");
        let response = provider_for(&mock_server)
            .hourly(&london(), Mode::Observation, Some(DateRange::single_day(day)))
            .await
            .expect("request succeeds");

        assert_eq!(response.timezone, "GMT");
        assert_eq!(response.hourly.len(), 2);
    }

    #[tokio::test]
    async fn forecast_hits_forecast_endpoint() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let response = provider_for(&mock_server)
            .hourly(&london(), Mode::Forecast, None)
            .await
            .expect("request succeeds");
        assert_eq!(response.hourly.get("weathercode").map(<[_]>::len), Some(2));
    }

    #[test]
    fn dates_are_omitted_without_range() {
        let params = query_params(&london(), None);
        assert!(params.iter().all(|(k, _)| *k != "start_date" && *k != "end_date"));
        assert_eq!(params.len(), 3);
    }

    #[tokio::test]
    async fn error_status_is_a_fetch_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/archive"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": true,
                "reason": "Parameter 'start_date' is out of allowed range"
            })))
            .mount(&mock_server)
            .await;

        let day = NaiveDate::from_ymd_opt(1900, 1, 1).expect("valid date");
        let err = provider_for(&mock_server)
            .hourly(&london(), Mode::Observation, Some(DateRange::single_day(day)))
            .await
            .unwrap_err();

        match err {
            FetchError::Status { city, status, body } => {
                assert_eq!(city, "London");
                assert_eq!(status.as_u16(), 400);
                assert!(body.contains("out of allowed range"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_hourly_is_malformed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "latitude": 51.5, "longitude": -0.12, "timezone": "GMT"
            })))
            .mount(&mock_server)
            .await;

        let err = provider_for(&mock_server)
            .hourly(&london(), Mode::Forecast, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
        assert!(err.to_string().contains("hourly"));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(body())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let http = Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .expect("client builds");
        let provider = OpenMeteoProvider::new(
            format!("{}/v1/archive", mock_server.uri()),
            format!("{}/v1/forecast", mock_server.uri()),
            http,
        );

        let err = provider
            .hourly(&london(), Mode::Forecast, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }));
    }
}
