use anyhow::Context;
use chrono::{Days, NaiveDate, Utc};
use reqwest::Client;
use std::sync::Arc;

use crate::{
    batch::BatchAssembler,
    config::{Config, FeatureGroupConfig},
    error::PipelineError,
    geocode::{CoordinateResolver, Geocoder, NominatimGeocoder},
    model::{Batch, DateRange, Mode, SchemaVariant},
    provider::{WeatherFetcher, WeatherProvider, openmeteo::OpenMeteoProvider},
    store::{FeatureStore, InsertJob, LocalFeatureStore, WriteOptions},
};

/// Distance of the observation and forecast days from the run date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOffsets {
    pub observation_days_ago: u32,
    pub forecast_days_ahead: u32,
}

impl WindowOffsets {
    pub fn for_variant(variant: SchemaVariant) -> Self {
        Self {
            observation_days_ago: 7,
            forecast_days_ahead: variant.forecast_days_ahead(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            observation_days_ago: config.observation_days_ago(),
            forecast_days_ahead: config.forecast_days_ahead(),
        }
    }

    pub fn observation_window(&self, today: NaiveDate) -> DateRange {
        DateRange::single_day(today - Days::new(u64::from(self.observation_days_ago)))
    }

    pub fn forecast_window(&self, today: NaiveDate) -> DateRange {
        DateRange::single_day(today + Days::new(u64::from(self.forecast_days_ahead)))
    }

    pub fn window(&self, mode: Mode, today: NaiveDate) -> DateRange {
        match mode {
            Mode::Observation => self.observation_window(today),
            Mode::Forecast => self.forecast_window(today),
        }
    }
}

/// A batch that was handed to the feature group.
#[derive(Debug)]
pub struct SubmittedBatch {
    pub batch: Batch,
    pub job: InsertJob,
}

/// Result of one run. The two modes fail independently.
#[derive(Debug)]
pub struct RunOutcome {
    pub today: NaiveDate,
    pub observations: Result<SubmittedBatch, PipelineError>,
    pub forecast: Result<SubmittedBatch, PipelineError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.observations.is_ok() && self.forecast.is_ok()
    }

    pub fn failures(&self) -> Vec<(Mode, &PipelineError)> {
        [
            (Mode::Observation, &self.observations),
            (Mode::Forecast, &self.forecast),
        ]
        .into_iter()
        .filter_map(|(mode, res)| res.as_ref().err().map(|e| (mode, e)))
        .collect()
    }

    /// Insert jobs of the batches that were submitted.
    pub fn into_jobs(self) -> Vec<(Mode, InsertJob)> {
        [
            (Mode::Observation, self.observations),
            (Mode::Forecast, self.forecast),
        ]
        .into_iter()
        .filter_map(|(mode, res)| res.ok().map(|s| (mode, s.job)))
        .collect()
    }
}

/// Builds the observation and forecast batches for a run date and writes them.
///
/// Holds no state between runs; each run gets its own coordinate cache.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    cities: Vec<String>,
    variant: SchemaVariant,
    offsets: WindowOffsets,
    feature_group: FeatureGroupConfig,
    concurrent_fetch: bool,
    geocoder: Arc<dyn Geocoder>,
    provider: Arc<dyn WeatherProvider>,
    store: Arc<dyn FeatureStore>,
}

impl PipelineRunner {
    pub fn new(
        config: &Config,
        geocoder: Arc<dyn Geocoder>,
        provider: Arc<dyn WeatherProvider>,
        store: Arc<dyn FeatureStore>,
    ) -> Self {
        Self {
            cities: config.cities.clone(),
            variant: config.variant,
            offsets: WindowOffsets::from_config(config),
            feature_group: config.feature_group.clone(),
            concurrent_fetch: config.concurrent_fetch,
            geocoder,
            provider,
            store,
        }
    }

    /// Wire the Nominatim geocoder, Open-Meteo and the local store from config.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;

        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .context("Failed to create HTTP client")?;

        let geocoder = NominatimGeocoder::new(&config.endpoints.geocoder_url, http.clone());
        let provider = OpenMeteoProvider::from_endpoints(&config.endpoints, http);
        let store = LocalFeatureStore::new(config.resolved_store_dir()?);

        Ok(Self::new(
            config,
            Arc::new(geocoder),
            Arc::new(provider),
            Arc::new(store),
        ))
    }

    pub fn cities(&self) -> &[String] {
        &self.cities
    }

    pub fn variant(&self) -> SchemaVariant {
        self.variant
    }

    pub fn offsets(&self) -> WindowOffsets {
        self.offsets
    }

    /// Run for the current UTC date.
    pub async fn run(&self) -> RunOutcome {
        self.run_for(Utc::now().date_naive()).await
    }

    #[tracing::instrument(skip(self), fields(variant = %self.variant))]
    pub async fn run_for(&self, today: NaiveDate) -> RunOutcome {
        let resolver = CoordinateResolver::new(self.geocoder.clone());

        let observations = self.build_and_submit(&resolver, Mode::Observation, today).await;
        let forecast = self.build_and_submit(&resolver, Mode::Forecast, today).await;

        RunOutcome {
            today,
            observations,
            forecast,
        }
    }

    /// Build both batches without writing them.
    pub async fn assemble_for(
        &self,
        today: NaiveDate,
    ) -> (Result<Batch, PipelineError>, Result<Batch, PipelineError>) {
        let resolver = CoordinateResolver::new(self.geocoder.clone());
        let observations = self.build(&resolver, Mode::Observation, today).await;
        let forecast = self.build(&resolver, Mode::Forecast, today).await;
        (observations, forecast)
    }

    async fn build(
        &self,
        resolver: &CoordinateResolver,
        mode: Mode,
        today: NaiveDate,
    ) -> Result<Batch, PipelineError> {
        let range = self.offsets.window(mode, today);
        tracing::info!(%mode, window = %range, cities = self.cities.len(), "Building batch");

        let fetcher = WeatherFetcher::new(resolver, self.provider.as_ref());
        BatchAssembler::new(fetcher, self.variant)
            .concurrent(self.concurrent_fetch)
            .assemble(&self.cities, Some(range), mode)
            .await
    }

    async fn build_and_submit(
        &self,
        resolver: &CoordinateResolver,
        mode: Mode,
        today: NaiveDate,
    ) -> Result<SubmittedBatch, PipelineError> {
        let result = async {
            let batch = self.build(resolver, mode, today).await?;
            let group = self
                .store
                .get_or_create_feature_group(&self.feature_group.name, self.feature_group.version)
                .await?;
            let job = group
                .insert(&batch, WriteOptions { wait_for_job: false })
                .await?;
            Ok::<_, PipelineError>(SubmittedBatch { batch, job })
        }
        .await;

        if let Err(e) = &result {
            tracing::warn!(%mode, kind = e.kind(), error = %e, "Batch not written");
        }
        result
    }
}
