//! Configuration loader for the `fieldtrack` engine.
//!
//! All runtime settings are read from environment variables here (the binary
//! loads an optional `.env` file first), so the rest of the crate never calls
//! `env::var` directly.
//!
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::location::{DEFAULT_BUFFER, MAX_BUFFER};
use crate::TrackingSettings;

/// Parse an optional unsigned integer environment variable with a default value.
macro_rules! parse_env_u64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean environment variable (`1|true|yes`, `0|false|no`).
macro_rules! parse_env_bool {
    ($var_name:expr, $default:expr) => {
        match env::var($var_name).ok().as_deref().map(str::trim) {
            None | Some("") => $default,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => return Err(anyhow!("Invalid {}: {}", $var_name, other)),
        }
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

pub const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// Strongly typed engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Realtime Database root, e.g. `https://<project>.firebasedatabase.app`.
    pub database_url: String,

    /// Web API key sent to the identity endpoints.
    pub api_key: String,

    pub identity_url: String,
    pub token_url: String,

    /// Milliseconds between location samples while tracking.
    pub location_interval_ms: u64,

    /// Location events buffered between the platform and the tracking loop.
    pub location_buffer: usize,

    /// Append every sample to the location history as well.
    pub record_history: bool,

    /// Driver credentials for the headless binary.
    pub email: Option<String>,
    pub password: Option<String>,

    /// Track replayed by the headless binary.
    pub track_file: Option<PathBuf>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `FIELDTRACK_DATABASE_URL` – Realtime Database root URL
/// - `FIELDTRACK_API_KEY` – web API key
///
/// Optional:
/// - `FIELDTRACK_IDENTITY_URL`, `FIELDTRACK_TOKEN_URL` – identity endpoints
/// - `LOCATION_INTERVAL_MS` – sample interval (default: 5000)
/// - `LOCATION_BUFFER` – location channel capacity, 1 to 4096 (default: 16)
/// - `RECORD_HISTORY` – also append to history (default: false)
/// - `FIELDTRACK_EMAIL`, `FIELDTRACK_PASSWORD`, `FIELDTRACK_TRACK_FILE`
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let database_url = require_env!("FIELDTRACK_DATABASE_URL");
    let api_key = require_env!("FIELDTRACK_API_KEY");
    let identity_url =
        env::var("FIELDTRACK_IDENTITY_URL").unwrap_or_else(|_| DEFAULT_IDENTITY_URL.to_string());
    let token_url =
        env::var("FIELDTRACK_TOKEN_URL").unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string());

    let location_interval_ms = parse_env_u64!("LOCATION_INTERVAL_MS", 5000);
    if location_interval_ms == 0 {
        return Err(anyhow!("LOCATION_INTERVAL_MS must be greater than zero"));
    }
    let location_buffer = parse_env_u64!("LOCATION_BUFFER", DEFAULT_BUFFER as u64);
    if location_buffer == 0 || location_buffer > MAX_BUFFER as u64 {
        return Err(anyhow!("LOCATION_BUFFER must be between 1 and {}", MAX_BUFFER));
    }
    let location_buffer = location_buffer as usize;
    let record_history = parse_env_bool!("RECORD_HISTORY", false);

    Ok(Config {
        database_url,
        api_key,
        identity_url,
        token_url,
        location_interval_ms,
        location_buffer,
        record_history,
        email: env::var("FIELDTRACK_EMAIL").ok(),
        password: env::var("FIELDTRACK_PASSWORD").ok(),
        track_file: env::var("FIELDTRACK_TRACK_FILE").ok().map(PathBuf::from),
    })
}

/// Show only the last four characters of a secret.
fn mask(secret: &str) -> String {
    // ---
    let count = secret.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{tail}")
}

impl Config {
    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings {
            interval: Duration::from_millis(self.location_interval_ms),
            record_history: self.record_history,
        }
    }

    /// Log the loaded configuration with secrets masked.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  FIELDTRACK_DATABASE_URL : {}", self.database_url);
        tracing::info!("  FIELDTRACK_API_KEY      : {}", mask(&self.api_key));
        tracing::info!("  FIELDTRACK_IDENTITY_URL : {}", self.identity_url);
        tracing::info!("  FIELDTRACK_TOKEN_URL    : {}", self.token_url);
        tracing::info!("  LOCATION_INTERVAL_MS    : {}", self.location_interval_ms);
        tracing::info!("  LOCATION_BUFFER         : {}", self.location_buffer);
        tracing::info!("  RECORD_HISTORY          : {}", self.record_history);
        tracing::info!(
            "  FIELDTRACK_EMAIL        : {}",
            self.email.as_deref().unwrap_or("<unset>")
        );
        tracing::info!(
            "  FIELDTRACK_PASSWORD     : {}",
            if self.password.is_some() { "****" } else { "<unset>" }
        );
        tracing::info!(
            "  FIELDTRACK_TRACK_FILE   : {}",
            self.track_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unset>".to_string())
        );
    }
}
