use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fs, path::PathBuf, time::Duration};

use crate::model::SchemaVariant;

pub const DEFAULT_CITIES: &[&str] = &[
    "Kyiv",
    "London",
    "Paris",
    "Stockholm",
    "New_York",
    "Los_Angeles",
    "Singapore",
    "Sydney",
    "Hong_Kong",
    "Rome",
];

pub const DEFAULT_ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";
pub const DEFAULT_FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_USER_AGENT: &str = concat!("weather-pipeline/", env!("CARGO_PKG_VERSION"));

/// Largest accepted distance, in days, between the run date and a batch window.
pub const MAX_WINDOW_DAYS: u32 = 366;

/// Name and version of the feature group batches are upserted into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureGroupConfig {
    pub name: String,
    pub version: u32,
}

impl Default for FeatureGroupConfig {
    fn default() -> Self {
        Self {
            name: "weather_data".to_string(),
            version: 1,
        }
    }
}

/// Optional overrides of the variant's date offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub observation_days_ago: Option<u32>,
    pub forecast_days_ahead: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub archive_url: String,
    pub forecast_url: String,
    pub geocoder_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            archive_url: DEFAULT_ARCHIVE_URL.to_string(),
            forecast_url: DEFAULT_FORECAST_URL.to_string(),
            geocoder_url: DEFAULT_GEOCODER_URL.to_string(),
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// variant = "basic"
/// cities = ["Kyiv", "London"]
///
/// [feature_group]
/// name = "weather_data"
/// version = 1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub variant: SchemaVariant,

    /// Cities in the order their rows appear in each batch.
    pub cities: Vec<String>,

    pub request_timeout_secs: u64,
    pub user_agent: String,

    /// Fetch all cities of a batch at once instead of one after another.
    pub concurrent_fetch: bool,

    /// Where the local feature store keeps its files. Platform data dir when unset.
    pub store_dir: Option<PathBuf>,

    // Tables last so the TOML output stays flat at the top.
    pub feature_group: FeatureGroupConfig,
    pub window: WindowConfig,
    pub endpoints: EndpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variant: SchemaVariant::default(),
            cities: DEFAULT_CITIES.iter().map(|c| c.to_string()).collect(),
            request_timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            concurrent_fetch: false,
            store_dir: None,
            feature_group: FeatureGroupConfig::default(),
            window: WindowConfig::default(),
            endpoints: EndpointConfig::default(),
        }
    }
}

impl Config {
    /// Load config from disk, or return the defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        cfg.validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "weather-pipeline", "weather-pipeline")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory of the local feature store.
    pub fn resolved_store_dir(&self) -> Result<PathBuf> {
        match &self.store_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("feature_store")),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn observation_days_ago(&self) -> u32 {
        self.window.observation_days_ago.unwrap_or(7)
    }

    pub fn forecast_days_ahead(&self) -> u32 {
        self.window
            .forecast_days_ahead
            .unwrap_or_else(|| self.variant.forecast_days_ahead())
    }

    /// Reject configurations that would produce ambiguous or empty batches.
    pub fn validate(&self) -> Result<()> {
        if self.cities.is_empty() {
            bail!(
                "No cities configured.\n\
                 Hint: run `weather-pipeline configure` or add a `cities` list to the config file."
            );
        }

        let mut seen = HashSet::new();
        for city in &self.cities {
            if city.trim().is_empty() {
                bail!("City names must not be blank.");
            }
            if !seen.insert(city.as_str()) {
                bail!("City '{city}' is configured more than once.");
            }
        }

        if self.feature_group.name.trim().is_empty() {
            bail!("Feature group name must not be blank.");
        }
        if self.feature_group.version == 0 {
            bail!("Feature group version must be 1 or greater.");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero.");
        }

        for (key, days) in [
            ("observation_days_ago", self.observation_days_ago()),
            ("forecast_days_ahead", self.forecast_days_ahead()),
        ] {
            if days > MAX_WINDOW_DAYS {
                bail!("window.{key} = {days} is out of range (at most {MAX_WINDOW_DAYS} days).");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().expect("defaults must validate");

        assert_eq!(cfg.cities.len(), 10);
        assert_eq!(cfg.cities[0], "Kyiv");
        assert_eq!(cfg.feature_group.name, "weather_data");
        assert_eq!(cfg.feature_group.version, 1);
    }

    #[test]
    fn window_defaults_follow_variant() {
        let mut cfg = Config::default();
        assert_eq!(cfg.observation_days_ago(), 7);
        assert_eq!(cfg.forecast_days_ahead(), 7);

        cfg.variant = SchemaVariant::Basic;
        assert_eq!(cfg.forecast_days_ahead(), 6);

        cfg.window.forecast_days_ahead = Some(3);
        assert_eq!(cfg.forecast_days_ahead(), 3);
    }

    #[test]
    fn duplicate_city_is_rejected() {
        let cfg = Config {
            cities: vec!["Rome".into(), "Paris".into(), "Rome".into()],
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("'Rome' is configured more than once"));
    }

    #[test]
    fn far_window_offsets_are_rejected() {
        let cfg: Config =
            toml::from_str("[window]\nobservation_days_ago = 4000000000").expect("parses");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("window.observation_days_ago"));

        let mut cfg = Config::default();
        cfg.window.forecast_days_ahead = Some(MAX_WINDOW_DAYS + 1);
        assert!(cfg.validate().is_err());

        cfg.window.forecast_days_ahead = Some(MAX_WINDOW_DAYS);
        cfg.window.observation_days_ago = Some(MAX_WINDOW_DAYS);
        cfg.validate().expect("bounds are inclusive");
    }

    #[test]
    fn empty_city_list_is_rejected() {
        let cfg = Config {
            cities: Vec::new(),
            ..Config::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("Hint: run `weather-pipeline configure`"));
    }

    #[test]
    fn zero_version_is_rejected() {
        let mut cfg = Config::default();
        cfg.feature_group.version = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            variant = "basic"
            cities = ["Kyiv", "Rome"]

            [feature_group]
            version = 2
            "#,
        )
        .expect("partial config should parse");

        assert_eq!(cfg.variant, SchemaVariant::Basic);
        assert_eq!(cfg.cities, vec!["Kyiv", "Rome"]);
        assert_eq!(cfg.feature_group.name, "weather_data");
        assert_eq!(cfg.feature_group.version, 2);
        assert_eq!(cfg.endpoints.archive_url, DEFAULT_ARCHIVE_URL);
        assert!(!cfg.concurrent_fetch);
    }

    #[test]
    fn save_and_load_roundtrip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.variant = SchemaVariant::Basic;
        cfg.store_dir = Some(dir.path().join("store"));
        cfg.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded, cfg);
    }
}
