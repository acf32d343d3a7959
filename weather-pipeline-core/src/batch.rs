use futures_util::future::try_join_all;
use std::collections::HashSet;

use crate::{
    error::{NormalizationError, PipelineError},
    model::{Batch, DateRange, Mode, SchemaVariant, WeatherRecord},
    normalize::normalize,
    provider::WeatherFetcher,
};

/// Builds one [`Batch`] from the configured cities.
///
/// The first failing city aborts the whole batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchAssembler<'a> {
    fetcher: WeatherFetcher<'a>,
    variant: SchemaVariant,
    concurrent: bool,
}

impl<'a> BatchAssembler<'a> {
    pub fn new(fetcher: WeatherFetcher<'a>, variant: SchemaVariant) -> Self {
        Self {
            fetcher,
            variant,
            concurrent: false,
        }
    }

    /// Request every city's weather at once. Coordinates are still resolved
    /// one city at a time, so the geocoder never sees parallel queries. Rows
    /// come out in configured order.
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    #[tracing::instrument(skip(self, cities), fields(cities = cities.len(), variant = %self.variant))]
    pub async fn assemble(
        &self,
        cities: &[String],
        range: Option<DateRange>,
        mode: Mode,
    ) -> Result<Batch, PipelineError> {
        let per_city: Vec<Vec<WeatherRecord>> = if self.concurrent {
            for city in cities {
                self.fetcher.resolve(city).await?;
            }
            try_join_all(
                cities
                    .iter()
                    .map(|city| self.city_records(city, range, mode)),
            )
            .await?
        } else {
            let mut out = Vec::with_capacity(cities.len());
            for city in cities {
                out.push(self.city_records(city, range, mode).await?);
            }
            out
        };

        let records: Vec<WeatherRecord> = per_city.into_iter().flatten().collect();
        ensure_unique_keys(&records)?;

        tracing::info!(rows = records.len(), "Assembled {mode} batch");
        Ok(Batch::new(mode, self.variant, range, records))
    }

    async fn city_records(
        &self,
        city: &str,
        range: Option<DateRange>,
        mode: Mode,
    ) -> Result<Vec<WeatherRecord>, PipelineError> {
        let (series, metadata) = self.fetcher.fetch(city, range, mode).await?;
        let records = normalize(&series, &metadata, mode, self.variant)?;
        tracing::debug!(city, rows = records.len(), "Normalized city");
        Ok(records)
    }
}

fn ensure_unique_keys(records: &[WeatherRecord]) -> Result<(), NormalizationError> {
    let mut seen = HashSet::with_capacity(records.len());
    for r in records {
        if !seen.insert((r.city_name.as_str(), r.base_time, r.forecast_hr)) {
            return Err(NormalizationError::DuplicateKey {
                city: r.city_name.clone(),
                base_time: r.base_time.to_string(),
                forecast_hr: r.forecast_hr,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{FetchError, ResolutionError},
        geocode::{CoordinateResolver, GeoPoint, Geocoder},
        model::CityCoordinate,
        provider::{RawResponse, WeatherProvider},
    };
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    #[derive(Debug)]
    struct GridGeocoder;

    #[async_trait]
    impl Geocoder for GridGeocoder {
        async fn geocode(&self, query: &str) -> Result<Option<GeoPoint>, ResolutionError> {
            let n = query.len() as f64;
            Ok(Some(GeoPoint {
                latitude: n,
                longitude: -n,
            }))
        }
    }

    /// Two hours per city; optionally fails for one city and delays earlier ones.
    #[derive(Debug, Default)]
    struct FakeProvider {
        fail_for: Option<&'static str>,
        stagger: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WeatherProvider for FakeProvider {
        async fn hourly(
            &self,
            coordinate: &CityCoordinate,
            _mode: Mode,
            _range: Option<DateRange>,
        ) -> Result<RawResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stagger {
                let wait = 60_u64.saturating_sub(coordinate.city_name.len() as u64 * 5);
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }
            if self.fail_for == Some(coordinate.city_name.as_str()) {
                return Err(FetchError::Status {
                    city: coordinate.city_name.clone(),
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "upstream unavailable".into(),
                });
            }
            Ok(serde_json::from_value(json!({
                "latitude": coordinate.latitude,
                "longitude": coordinate.longitude,
                "timezone": "GMT",
                "hourly_units": {},
                "hourly": {
                    "time": ["2024-01-08T00:00", "2024-01-08T01:00"],
                    "temperature_2m": [1.0, 2.0],
                    "relativehumidity_2m": [70, 71],
                    "precipitation": [0.0, 0.0],
                    "weathercode": [0, 1],
                    "windspeed_10m": [5.0, 6.0],
                    "winddirection_10m": [90, 95]
                }
            }))
            .expect("fixture parses"))
        }
    }

    fn cities() -> Vec<String> {
        crate::config::DEFAULT_CITIES
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    fn day() -> Option<DateRange> {
        NaiveDate::from_ymd_opt(2024, 1, 8).map(DateRange::single_day)
    }

    #[tokio::test]
    async fn batch_keeps_city_order_without_duplicates() {
        let resolver = CoordinateResolver::new(Arc::new(GridGeocoder));
        let provider = FakeProvider::default();
        let assembler = BatchAssembler::new(
            WeatherFetcher::new(&resolver, &provider),
            SchemaVariant::Extended,
        );

        let batch = assembler
            .assemble(&cities(), day(), Mode::Observation)
            .await
            .expect("assembles");

        assert_eq!(batch.len(), 20);
        assert_eq!(batch.cities(), crate::config::DEFAULT_CITIES.to_vec());
        assert_eq!(batch.columns(), SchemaVariant::Extended.columns());

        let keys: HashSet<_> = batch.records().iter().map(WeatherRecord::key).collect();
        assert_eq!(keys.len(), batch.len());
    }

    #[tokio::test]
    async fn one_failing_city_fails_the_batch() {
        let resolver = CoordinateResolver::new(Arc::new(GridGeocoder));
        let provider = FakeProvider {
            fail_for: Some("Stockholm"),
            ..FakeProvider::default()
        };
        let assembler = BatchAssembler::new(
            WeatherFetcher::new(&resolver, &provider),
            SchemaVariant::Basic,
        );

        let err = assembler
            .assemble(&cities(), day(), Mode::Forecast)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Fetch(FetchError::Status { ref city, .. }) if city == "Stockholm"));
        // Kyiv, London, Paris, then Stockholm; nothing after the failure.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn concurrent_fetch_preserves_configured_order() {
        let resolver = CoordinateResolver::new(Arc::new(GridGeocoder));
        let provider = FakeProvider {
            stagger: true,
            ..FakeProvider::default()
        };
        let assembler = BatchAssembler::new(
            WeatherFetcher::new(&resolver, &provider),
            SchemaVariant::Basic,
        )
        .concurrent(true);

        let batch = assembler
            .assemble(&cities(), day(), Mode::Forecast)
            .await
            .expect("assembles");

        assert_eq!(batch.cities(), crate::config::DEFAULT_CITIES.to_vec());
        let hours: Vec<u32> = batch.records().iter().map(|r| r.forecast_hr).collect();
        assert_eq!(hours, [0, 1].repeat(10));
    }

    #[tokio::test]
    async fn concurrent_fetch_still_fails_fast() {
        let resolver = CoordinateResolver::new(Arc::new(GridGeocoder));
        let provider = FakeProvider {
            fail_for: Some("Rome"),
            stagger: true,
            ..FakeProvider::default()
        };
        let assembler = BatchAssembler::new(
            WeatherFetcher::new(&resolver, &provider),
            SchemaVariant::Basic,
        )
        .concurrent(true);

        assert!(
            assembler
                .assemble(&cities(), day(), Mode::Observation)
                .await
                .is_err()
        );
    }

    /// Tracks how many lookups overlap.
    #[derive(Debug, Default)]
    struct SlowGeocoder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for SlowGeocoder {
        async fn geocode(&self, query: &str) -> Result<Option<GeoPoint>, ResolutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let n = query.len() as f64;
            Ok(Some(GeoPoint {
                latitude: n,
                longitude: n,
            }))
        }
    }

    #[tokio::test]
    async fn concurrent_fetch_geocodes_one_city_at_a_time() {
        let geocoder = Arc::new(SlowGeocoder::default());
        let resolver = CoordinateResolver::new(geocoder.clone());
        let provider = FakeProvider::default();
        let assembler = BatchAssembler::new(
            WeatherFetcher::new(&resolver, &provider),
            SchemaVariant::Basic,
        )
        .concurrent(true);

        let batch = assembler
            .assemble(&cities(), day(), Mode::Observation)
            .await
            .expect("assembles");

        assert_eq!(batch.len(), 20);
        assert_eq!(geocoder.peak.load(Ordering::SeqCst), 1);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 10);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn city_listed_twice_is_rejected() {
        let resolver = CoordinateResolver::new(Arc::new(GridGeocoder));
        let provider = FakeProvider::default();
        let assembler = BatchAssembler::new(
            WeatherFetcher::new(&resolver, &provider),
            SchemaVariant::Basic,
        );

        let err = assembler
            .assemble(&["Rome".to_string(), "Rome".to_string()], day(), Mode::Observation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Normalization(NormalizationError::DuplicateKey { .. })
        ));
    }
}
