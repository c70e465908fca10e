//! Runtime configuration loaded from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default retry ceiling before a transient failure becomes terminal.
pub const DEFAULT_MAX_RETRIES: i64 = 5;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the remote order API, normalised.
    pub api_base_url: String,
    /// Value sent as `X-POS-API-Key`.
    pub api_key: String,
    /// Directory holding `orders.db` and the log files.
    pub data_dir: PathBuf,
    pub max_retries: i64,
    /// Backoff after a failed item is `backoff_base * 2^min(retry_count, 4)`.
    pub backoff_base: Duration,
    pub sync_interval: Duration,
    pub http_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            api_key: String::new(),
            data_dir: PathBuf::from("./data"),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(1_000),
            sync_interval: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, reading a `.env`
    /// file first when one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let api_base_url = env::var("POS_API_URL")
            .ok()
            .map(|v| normalize_api_url(&v))
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingApiUrl)?;

        let api_key = env::var("POS_API_KEY").unwrap_or_default();

        let data_dir = env::var("POS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let max_retries = parse_var("POS_SYNC_MAX_RETRIES")?.unwrap_or(defaults.max_retries);
        if max_retries < 1 {
            return Err(ConfigError::Invalid("POS_SYNC_MAX_RETRIES"));
        }
        let backoff_base = parse_var("POS_SYNC_BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_base);
        let sync_interval = parse_var("POS_SYNC_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.sync_interval);
        let http_timeout = parse_var("POS_HTTP_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        Ok(Self {
            api_base_url,
            api_key,
            data_dir,
            max_retries,
            backoff_base,
            sync_interval,
            http_timeout,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name)),
        _ => Ok(None),
    }
}

/// Normalise the API URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_api_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // "/api/" leaves a trailing slash behind
    while url.ends_with('/') {
        url.pop();
    }

    url
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("POS_API_URL environment variable is required")]
    MissingApiUrl,

    #[error("invalid value for {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "POS_API_URL",
        "POS_API_KEY",
        "POS_DATA_DIR",
        "POS_SYNC_MAX_RETRIES",
        "POS_SYNC_BACKOFF_BASE_MS",
        "POS_SYNC_INTERVAL_SECS",
        "POS_HTTP_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_normalize_api_url() {
        assert_eq!(normalize_api_url("pos.example.com/api/"), "https://pos.example.com");
        assert_eq!(normalize_api_url("localhost:3000/"), "http://localhost:3000");
        assert_eq!(
            normalize_api_url("https://pos.example.com//"),
            "https://pos.example.com"
        );
        assert_eq!(normalize_api_url("   "), "");
    }

    #[test]
    #[serial]
    fn test_from_env_reads_values() {
        clear_env();
        env::set_var("POS_API_URL", "pos.example.com/api");
        env::set_var("POS_API_KEY", "key-123");
        env::set_var("POS_SYNC_MAX_RETRIES", "3");
        env::set_var("POS_SYNC_BACKOFF_BASE_MS", "250");

        let config = SyncConfig::from_env().expect("valid config");
        assert_eq!(config.api_base_url, "https://pos.example.com");
        assert_eq!(config.api_key, "key-123");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        clear_env();
        assert!(matches!(
            SyncConfig::from_env(),
            Err(ConfigError::MissingApiUrl)
        ));

        env::set_var("POS_API_URL", "localhost:3000");
        env::set_var("POS_SYNC_MAX_RETRIES", "lots");
        assert!(matches!(
            SyncConfig::from_env(),
            Err(ConfigError::Invalid("POS_SYNC_MAX_RETRIES"))
        ));

        env::set_var("POS_SYNC_MAX_RETRIES", "0");
        assert!(matches!(
            SyncConfig::from_env(),
            Err(ConfigError::Invalid("POS_SYNC_MAX_RETRIES"))
        ));
        clear_env();
    }
}
