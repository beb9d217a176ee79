//! Server configuration, read from `BOOKD_*` environment variables with
//! fallback to defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::OverlapPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Cleartext password for the wire handshake.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    /// Prometheus exporter port; `None` disables it.
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub user_service_url: String,
    pub listing_service_url: String,
    /// Budget for all existence checks of one request.
    pub existence_timeout: Duration,
    pub overlap_policy: OverlapPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Config {
            bind: get("BOOKD_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "BOOKD_PORT", 5433)?,
            data_dir: PathBuf::from(get("BOOKD_DATA_DIR").unwrap_or_else(|| "./data".to_string())),
            password: get("BOOKD_PASSWORD").unwrap_or_else(|| "bookd".to_string()),
            max_connections: parse_or(&get, "BOOKD_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "BOOKD_COMPACT_THRESHOLD", 1000)?,
            metrics_port: get("BOOKD_METRICS_PORT")
                .map(|v| v.trim().parse())
                .transpose()
                .map_err(|_| ConfigError::InvalidValue("BOOKD_METRICS_PORT".to_string()))?,
            tls_cert: get("BOOKD_TLS_CERT"),
            tls_key: get("BOOKD_TLS_KEY"),
            user_service_url: required_url(&get, "BOOKD_USER_SERVICE_URL")?,
            listing_service_url: required_url(&get, "BOOKD_LISTING_SERVICE_URL")?,
            existence_timeout: Duration::from_millis(parse_or(&get, "BOOKD_EXISTENCE_TIMEOUT_MS", 5000)?),
            overlap_policy: parse_or(&get, "BOOKD_OVERLAP_POLICY", OverlapPolicy::Blocking)?,
        };

        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::MissingTlsConfig);
        }
        if config.max_connections == 0 {
            return Err(ConfigError::InvalidValue("BOOKD_MAX_CONNECTIONS".to_string()));
        }
        if config.existence_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("BOOKD_EXISTENCE_TIMEOUT_MS".to_string()));
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn required_url<G>(get: &G, key: &str) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let url = get(key).ok_or_else(|| ConfigError::MissingRequired(key.to_string()))?;
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::InvalidValue(key.to_string()));
    }
    Ok(url.to_string())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("both BOOKD_TLS_CERT and BOOKD_TLS_KEY must be set, or neither")]
    MissingTlsConfig,

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
