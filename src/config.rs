use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_USER_AGENT: &str = "StoryLocations/0.1";
const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_RATE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider_base_url: String,
    pub provider_user_agent: String,
    pub provider_email: Option<String>,
    pub provider_timeout_secs: u64,
    pub provider_search_limit: usize,
    pub offline_provider: bool,
    pub cache_ttl_secs: u64,
    pub cache_persistent: bool,
    pub rate_interval_ms: u64,
    pub rate_burst: u32,
    pub acquire_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_reset_secs: u64,
    pub database_file_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicAppConfig {
    pub provider_base_url: String,
    pub provider_user_agent: String,
    pub has_provider_email: bool,
    pub offline_provider: bool,
    pub cache_ttl_secs: u64,
    pub cache_persistent: bool,
    pub rate_interval_ms: u64,
    pub rate_burst: u32,
    pub acquire_timeout_ms: u64,
    pub database_file_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider_base_url: DEFAULT_BASE_URL.to_string(),
            provider_user_agent: DEFAULT_USER_AGENT.to_string(),
            provider_email: None,
            provider_timeout_secs: 10,
            provider_search_limit: 5,
            offline_provider: false,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_persistent: false,
            rate_interval_ms: DEFAULT_RATE_INTERVAL_MS,
            rate_burst: 1,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            backoff_reset_secs: 60,
            database_file_name: "story-locations.db".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            provider_base_url: env::var("GEOCODER_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .unwrap_or(defaults.provider_base_url),
            provider_user_agent: env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.provider_user_agent),
            provider_email: env::var("GEOCODER_EMAIL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            provider_timeout_secs: parse_u64(
                "GEOCODER_HTTP_TIMEOUT_SECS",
                defaults.provider_timeout_secs,
            )
            .clamp(1, 60),
            provider_search_limit: parse_usize(
                "GEOCODER_SEARCH_LIMIT",
                defaults.provider_search_limit,
            )
            .clamp(1, 50),
            offline_provider: parse_bool("GEOCODER_OFFLINE", defaults.offline_provider),
            cache_ttl_secs: parse_u64("GEOCODE_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            cache_persistent: parse_bool("GEOCODE_CACHE_PERSISTENT", defaults.cache_persistent),
            rate_interval_ms: parse_u64("RATE_LIMIT_INTERVAL_MS", defaults.rate_interval_ms)
                .max(1),
            rate_burst: parse_u32("RATE_LIMIT_BURST", defaults.rate_burst).max(1),
            acquire_timeout_ms: parse_u64(
                "RATE_LIMIT_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout_ms,
            ),
            backoff_base_ms: parse_u64("RATE_LIMIT_BACKOFF_BASE_MS", defaults.backoff_base_ms)
                .max(1),
            backoff_max_ms: parse_u64("RATE_LIMIT_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            backoff_reset_secs: parse_u64(
                "RATE_LIMIT_BACKOFF_RESET_SECS",
                defaults.backoff_reset_secs,
            ),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or(defaults.database_file_name),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            provider_base_url: self.provider_base_url.clone(),
            provider_user_agent: self.provider_user_agent.clone(),
            has_provider_email: self.provider_email.is_some(),
            offline_provider: self.offline_provider,
            cache_ttl_secs: self.cache_ttl_secs,
            cache_persistent: self.cache_persistent,
            rate_interval_ms: self.rate_interval_ms,
            rate_burst: self.rate_burst,
            acquire_timeout_ms: self.acquire_timeout_ms,
            database_file_name: self.database_file_name.clone(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
