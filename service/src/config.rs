use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8788";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_EVENT_DEDUP_WINDOW_SECONDS: i64 = 300;
const DEFAULT_PAGE_LIMIT: u32 = 20;
const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub environment: String,
    pub database_path: Option<PathBuf>,
    pub api_keys: Vec<String>,
    pub stripe_webhook_secret: Option<String>,
    pub event_dedup_window_seconds: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SC_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env_string("SC_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw.clone(),
                source,
            })?;

        Ok(Self {
            bind_addr,
            log_filter: env_string("SC_LOG_FILTER").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            environment: env_string("SC_ENVIRONMENT")
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            database_path: env_string("SC_DATABASE_PATH").map(PathBuf::from),
            api_keys: env_string("SC_API_KEYS")
                .map(|raw| split_csv(&raw))
                .unwrap_or_default(),
            stripe_webhook_secret: env_string("SC_STRIPE_WEBHOOK_SECRET"),
            event_dedup_window_seconds: DEFAULT_EVENT_DEDUP_WINDOW_SECONDS,
        })
    }

    pub fn for_tests(database_path: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            environment: "test".to_string(),
            database_path: Some(database_path),
            api_keys: vec!["test-api-key".to_string()],
            stripe_webhook_secret: Some("whsec_test_secret".to_string()),
            event_dedup_window_seconds: DEFAULT_EVENT_DEDUP_WINDOW_SECONDS,
        }
    }

    pub fn default_page_limit(&self) -> u32 {
        DEFAULT_PAGE_LIMIT
    }

    pub fn max_page_limit(&self) -> u32 {
        MAX_PAGE_LIMIT
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}
