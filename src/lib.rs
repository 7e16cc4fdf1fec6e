mod cache;
mod commands;
mod config;
mod db;
mod errors;
mod gazetteer;
mod model;
mod nominatim;
mod provider;
mod rate_limit;
mod resolver;
mod scoring;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection as SqlConnection;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::DatabaseContext;

pub use cache::{
    CacheBackend, CacheEntry, CacheKey, CacheStats, CachedLookup, MemoryCacheBackend, ResultCache,
    SqliteCacheBackend,
};
pub use commands::{
    get_location, reverse_geocode, save_location, search_places, service_health, ServiceHealth,
};
pub use config::{AppConfig, PublicAppConfig};
pub use db::{bootstrap, open_in_memory};
pub use errors::{AppError, AppResult};
pub use gazetteer::{haversine_km, GazetteerEntry, GazetteerProvider};
pub use model::{
    FieldOrigin, LocationFields, LocationSource, PlaceCandidate, ResolvedLocation, SaveInput,
};
pub use nominatim::NominatimProvider;
pub use provider::{provider_from_config, GeoProvider};
pub use rate_limit::{RateBudgetSnapshot, RateLimiter, RatePolicy};
pub use resolver::LocationResolver;
pub use scoring::{AddressQuality, ConfidenceScorer};
pub use store::{PlaceStore, SqlitePlaceStore};

/// Process-wide location service: one rate budget, one cache, one store.
pub struct LocationService {
    resolver: LocationResolver,
    db_path: Option<PathBuf>,
    config: AppConfig,
}

impl LocationService {
    pub fn initialize<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let DatabaseContext { connection, path } =
            bootstrap(data_dir, &config.database_file_name)?;
        let provider = provider_from_config(&config)?;
        let service = Self::assemble(
            Arc::new(Mutex::new(connection)),
            Some(path),
            config,
            provider,
        );
        info!(
            provider = service.resolver.provider_name(),
            "location service ready"
        );
        Ok(service)
    }

    pub fn with_provider<P: AsRef<Path>>(
        data_dir: P,
        config: AppConfig,
        provider: Arc<dyn GeoProvider>,
    ) -> AppResult<Self> {
        let DatabaseContext { connection, path } =
            bootstrap(data_dir, &config.database_file_name)?;
        Ok(Self::assemble(
            Arc::new(Mutex::new(connection)),
            Some(path),
            config,
            provider,
        ))
    }

    pub fn in_memory(config: AppConfig, provider: Arc<dyn GeoProvider>) -> AppResult<Self> {
        let connection = open_in_memory()?;
        Ok(Self::assemble(
            Arc::new(Mutex::new(connection)),
            None,
            config,
            provider,
        ))
    }

    fn assemble(
        db: Arc<Mutex<SqlConnection>>,
        db_path: Option<PathBuf>,
        config: AppConfig,
        provider: Arc<dyn GeoProvider>,
    ) -> Self {
        let backend: Arc<dyn CacheBackend> = if config.cache_persistent {
            Arc::new(SqliteCacheBackend::new(Arc::clone(&db)))
        } else {
            Arc::new(MemoryCacheBackend::new())
        };
        let cache = Arc::new(ResultCache::new(backend, config.cache_ttl()));
        if config.cache_persistent {
            let purged = cache.purge_expired();
            info!(target: "result_cache", purged, "expired cache entries removed");
        }
        let limiter = Arc::new(RateLimiter::new(RatePolicy::from_config(&config)));
        let store = Arc::new(SqlitePlaceStore::new(db));
        let resolver = LocationResolver::new(
            provider,
            limiter,
            cache,
            store,
            config.acquire_timeout(),
        );
        Self {
            resolver,
            db_path,
            config,
        }
    }

    pub fn resolver(&self) -> &LocationResolver {
        &self.resolver
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            provider: self.resolver.provider_name().to_string(),
            db_path: self
                .db_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            rate_budget: self.resolver.rate_budget(),
            cache: self.resolver.cache_stats(),
            config: self.config.public_profile(),
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,story_locations=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
