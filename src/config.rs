use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

use crate::engine::EngineSettings;
use crate::models::BrokerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub store_path: String,
    pub save_debounce_ms: u64,
    pub initial_scan: bool,
    pub log_level: Level,

    /// Seeds the broker settings until the operator saves their own.
    pub default_broker: BrokerConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_DEBOUNCE: u64 = 10;
        const MAX_DEBOUNCE: u64 = 60_000;

        if !(MIN_DEBOUNCE..=MAX_DEBOUNCE).contains(&self.save_debounce_ms) {
            return Err(ConfigError::ParsingError(format!(
                "SCRAPER_SAVE_DEBOUNCE_MS must be between {} and {} ms",
                MIN_DEBOUNCE, MAX_DEBOUNCE
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BrokerConfig::default();

        let config = Self {
            store_path: lookup("SCRAPER_STORE_PATH").unwrap_or_else(|| "scraper_settings.db".to_string()),
            save_debounce_ms: parse_or(&lookup, "SCRAPER_SAVE_DEBOUNCE_MS", 1000)?,
            initial_scan: parse_bool(&lookup, "SCRAPER_INITIAL_SCAN", true)?,
            log_level: parse_or(&lookup, "LOG_LEVEL", Level::INFO)?,

            default_broker: BrokerConfig {
                client_id: lookup("MQTT_CLIENT_ID").unwrap_or(defaults.client_id.clone()),
                host: lookup("MQTT_HOST").unwrap_or(defaults.host.clone()),
                port: parse_or(&lookup, "MQTT_PORT", defaults.port)?,
                ..defaults
            },
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            save_debounce: Duration::from_millis(self.save_debounce_ms),
            initial_scan: self.initial_scan,
            default_broker: self.default_broker.clone(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::MissingOrInvalid(key.to_string())),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(_) => Err(ConfigError::MissingOrInvalid(key.to_string())),
    }
}
