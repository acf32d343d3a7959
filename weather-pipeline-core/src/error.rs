//! Error kinds raised while building and writing a batch.
//!
//! Every variant of [`PipelineError`] is fatal to the batch it was raised in.
//! Nothing in this crate retries.

use thiserror::Error;

/// A city name could not be turned into coordinates.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Geocoder returned no match for city '{city}'")]
    NotFound { city: String },

    #[error("Geocoding request for city '{city}' failed: {source}")]
    Request {
        city: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Geocoding request for city '{city}' failed with status {status}: {body}")]
    Status {
        city: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Unexpected geocoder response for city '{city}': {message}")]
    Parse { city: String, message: String },
}

/// The weather provider request failed or answered with an unexpected shape.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Weather request for city '{city}' failed: {source}")]
    Request {
        city: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Weather request for city '{city}' failed with status {status}: {body}")]
    Status {
        city: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Malformed weather response for city '{city}': {message}")]
    Malformed { city: String, message: String },

    #[error("Observation request for city '{city}' needs a start and end date")]
    MissingDateRange { city: String },
}

/// A successful response did not fit the canonical record schema.
#[derive(Error, Debug)]
pub enum NormalizationError {
    #[error("Response for city '{city}' has no '{column}' series")]
    MissingColumn { city: String, column: String },

    #[error("Response for city '{city}' contains no hours")]
    Empty { city: String },

    #[error("Series '{column}' for city '{city}' has {found} values, expected {expected}")]
    LengthMismatch {
        city: String,
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("Cannot parse timestamp '{value}' for city '{city}'")]
    InvalidTime { city: String, value: String },

    #[error("Unexpected value {value} in series '{column}' at row {row} for city '{city}'")]
    InvalidValue {
        city: String,
        column: String,
        row: usize,
        value: String,
    },

    #[error("Duplicate hour {base_time} (forecast_hr {forecast_hr}) for city '{city}'")]
    DuplicateKey {
        city: String,
        base_time: String,
        forecast_hr: u32,
    },
}

/// The feature-store writer rejected or failed to persist a batch.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Feature store I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Feature group file {path} is not valid: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "Batch columns {found:?} do not match the layout of feature group '{group}' ({expected:?})"
    )]
    SchemaMismatch {
        group: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Insert job {job_id} did not complete: {message}")]
    Job { job_id: u64, message: String },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolution(_) => "resolution",
            Self::Fetch(_) => "fetch",
            Self::Normalization(_) => "normalization",
            Self::Store(_) => "store",
        }
    }
}
