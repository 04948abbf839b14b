//! services/sync/src/config.rs
//!
//! Defines the service's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use axum::http::HeaderValue;
use spirit_core::{FeedOptions, OrphanPolicy, ReconcilerOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub session_path: PathBuf,
    pub scrape_function_url: Option<String>,
    pub scrape_api_key: Option<String>,
    /// Bearer token the backend's webhooks must present.
    pub webhook_secret: String,
    /// The one browser origin allowed by CORS. Any origin when unset.
    pub allowed_origin: Option<HeaderValue>,
    pub suppression_window: Duration,
    pub recheck_visibility: bool,
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff: Duration,
    pub orphan_policy: OrphanPolicy,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // --- Server and Database Settings ---
        let bind_address =
            parse_or(&lookup, "BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 3000)))?;

        let database_url = required(&lookup, "DATABASE_URL")?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let session_path = lookup("SESSION_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./.spirit/session.json"));

        // --- Scraping Function (optional) ---
        let scrape_function_url = lookup("SCRAPE_FUNCTION_URL");
        let scrape_api_key = lookup("SCRAPE_API_KEY");

        // --- Ingress ---
        let webhook_secret = required(&lookup, "WEBHOOK_SECRET")?;
        let allowed_origin = lookup("ALLOWED_ORIGIN")
            .map(|origin| {
                origin.trim().parse::<HeaderValue>().map_err(|e| {
                    ConfigError::InvalidValue("ALLOWED_ORIGIN".to_string(), e.to_string())
                })
            })
            .transpose()?;

        // --- Feed Tuning ---
        let suppression_window =
            Duration::from_millis(parse_or(&lookup, "SUPPRESSION_WINDOW_MS", 2000u64)?);
        let recheck_visibility = parse_or(&lookup, "RECHECK_VISIBILITY", false)?;
        let resubscribe_attempts = parse_or(&lookup, "RESUBSCRIBE_ATTEMPTS", 3u32)?;
        let resubscribe_backoff =
            Duration::from_millis(parse_or(&lookup, "RESUBSCRIBE_BACKOFF_MS", 500u64)?);
        let orphan_policy = parse_or(&lookup, "ORPHAN_REPLIES", OrphanPolicy::default())?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            session_path,
            scrape_function_url,
            scrape_api_key,
            webhook_secret,
            allowed_origin,
            suppression_window,
            recheck_visibility,
            resubscribe_attempts,
            resubscribe_backoff,
            orphan_policy,
        })
    }

    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            reconciler: ReconcilerOptions {
                suppression_window: self.suppression_window,
                recheck_visibility: self.recheck_visibility,
            },
            resubscribe_attempts: self.resubscribe_attempts,
            resubscribe_backoff: self.resubscribe_backoff,
        }
    }
}

/// Reads `name`, treating a blank value as missing.
fn required(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String, ConfigError> {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

/// Parses `name` when set, otherwise returns `default`.
fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}
