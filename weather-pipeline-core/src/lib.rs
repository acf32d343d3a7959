//! Core library for the `weather-pipeline` tool.
//!
//! This crate defines:
//! - Configuration (city list, schema variant, feature group, endpoints)
//! - City geocoding and the Open-Meteo hourly provider
//! - Normalization of provider series into the canonical record schema
//! - Batch assembly and the feature-store boundary
//!
//! [`PipelineRunner`] ties these together; `weather-pipeline-cli` drives it
//! once or on a schedule.

pub mod batch;
pub mod config;
pub mod error;
pub mod geocode;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod store;

pub use batch::BatchAssembler;
pub use config::{Config, EndpointConfig, FeatureGroupConfig, WindowConfig};
pub use error::{FetchError, NormalizationError, PipelineError, ResolutionError, StoreError};
pub use geocode::{CoordinateResolver, Geocoder, NominatimGeocoder};
pub use model::{Batch, CityCoordinate, DateRange, Mode, SchemaVariant, WeatherRecord};
pub use normalize::normalize;
pub use pipeline::{PipelineRunner, RunOutcome, SubmittedBatch, WindowOffsets};
pub use provider::{Metadata, RawSeries, WeatherFetcher, WeatherProvider};
pub use store::{FeatureGroup, FeatureStore, InsertJob, LocalFeatureStore, WriteOptions};
