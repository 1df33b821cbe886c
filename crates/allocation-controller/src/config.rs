//! Allocation controller configuration.
//!
//! Configuration is loaded from environment variables. The two catalog
//! documents (locations and claimants) are referenced by path here and
//! loaded once at startup by [`crate::catalog`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::env;
use thiserror::Error;

/// Default bind address for the client-facing API (WebSocket + operator).
pub const DEFAULT_API_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default bind address for health and metrics endpoints.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default countdown window before the session opens, in seconds.
pub const DEFAULT_COUNTDOWN_SECONDS: u64 = 60;

/// Default maximum total resources per claimant.
pub const DEFAULT_GLOBAL_CAP: u32 = 3;

/// Default maximum resources per claimant outside the home location.
pub const DEFAULT_OFF_HOME_CAP: u32 = 1;

/// Allocation controller configuration.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client-facing API bind address (default: "0.0.0.0:8080").
    pub api_bind_address: String,

    /// Health/metrics endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Path to the locations document (locations, per-location caps,
    /// resource lists).
    pub locations_path: String,

    /// Path to the claimants document (tokens and display names).
    pub claimants_path: String,

    /// Instant at which the session opens (RFC 3339).
    pub start_time: DateTime<Utc>,

    /// Countdown window before `start_time` during which ticks are
    /// broadcast (default: 60).
    pub countdown_seconds: u64,

    /// Maximum total resources per claimant (default: 3).
    pub global_cap: u32,

    /// Maximum resources per claimant outside the home location
    /// (default: 1).
    pub off_home_cap: u32,

    /// The distinguished home location. Must exist in the locations
    /// document; validated at startup.
    pub home_location: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let locations_path = vars
            .get("ALLOC_LOCATIONS_PATH")
            .ok_or_else(|| ConfigError::MissingEnvVar("ALLOC_LOCATIONS_PATH".to_string()))?
            .clone();

        let claimants_path = vars
            .get("ALLOC_CLAIMANTS_PATH")
            .ok_or_else(|| ConfigError::MissingEnvVar("ALLOC_CLAIMANTS_PATH".to_string()))?
            .clone();

        let home_location = vars
            .get("ALLOC_HOME_LOCATION")
            .ok_or_else(|| ConfigError::MissingEnvVar("ALLOC_HOME_LOCATION".to_string()))?
            .clone();

        let start_time_raw = vars
            .get("ALLOC_START_TIME")
            .ok_or_else(|| ConfigError::MissingEnvVar("ALLOC_START_TIME".to_string()))?;
        let start_time = DateTime::parse_from_rfc3339(start_time_raw)
            .map_err(|e| ConfigError::InvalidValue {
                var: "ALLOC_START_TIME".to_string(),
                message: format!("expected RFC 3339 timestamp: {e}"),
            })?
            .with_timezone(&Utc);

        let api_bind_address = vars
            .get("ALLOC_API_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_API_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("ALLOC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let countdown_seconds = parse_or_default(
            vars,
            "ALLOC_COUNTDOWN_SECONDS",
            DEFAULT_COUNTDOWN_SECONDS,
        )?;
        let global_cap = parse_or_default(vars, "ALLOC_GLOBAL_CAP", DEFAULT_GLOBAL_CAP)?;
        let off_home_cap = parse_or_default(vars, "ALLOC_OFF_HOME_CAP", DEFAULT_OFF_HOME_CAP)?;

        Ok(Config {
            api_bind_address,
            health_bind_address,
            locations_path,
            claimants_path,
            start_time,
            countdown_seconds,
            global_cap,
            off_home_cap,
            home_location,
        })
    }
}

/// Parse an optional numeric variable, surfacing garbage values instead of
/// silently falling back to the default.
fn parse_or_default<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    var: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match vars.get(var) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            message: format!("{e}"),
        }),
    }
}
