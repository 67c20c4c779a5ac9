//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. The database
//! URL is wrapped in secrecy::SecretString to keep credentials out of logs.

pub mod secrets;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub const DEFAULT_BIND: ([u8; 4], u16) = ([127, 0, 0, 1], 9120);
pub const DEFAULT_STEPS_DIR: &str = "steps";
pub const DEFAULT_STUCK_THRESHOLD_MS: u64 = 300_000;
pub const DEFAULT_STUCK_SCAN_SECS: u64 = 60;

#[derive(Debug)]
pub struct Config {
    /// Unset means the in-memory store.
    pub database_url: Option<SecretString>,
    pub bind_addr: SocketAddr,
    pub steps_dir: PathBuf,
    pub stuck_threshold: Duration,
    /// `None` disables the in-process stuck watcher.
    pub stuck_scan_interval: Option<Duration>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let scan_secs: u64 = parsed_var("TRACKER_STUCK_SCAN_SECS", DEFAULT_STUCK_SCAN_SECS)?;

        Ok(Self {
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            bind_addr: parsed_var("TRACKER_BIND", SocketAddr::from(DEFAULT_BIND))?,
            steps_dir: optional_var("TRACKER_STEPS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STEPS_DIR)),
            stuck_threshold: Duration::from_millis(parsed_var(
                "TRACKER_STUCK_THRESHOLD_MS",
                DEFAULT_STUCK_THRESHOLD_MS,
            )?),
            stuck_scan_interval: (scan_secs > 0).then(|| Duration::from_secs(scan_secs)),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Blank values count as unset.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
    }
}
