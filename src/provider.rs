use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::gazetteer::GazetteerProvider;
use crate::model::PlaceCandidate;
use crate::nominatim::NominatimProvider;

/// An external geocoding source.
///
/// Implementations return candidates already confidence-scored. Upstream
/// throttling is reported as [`crate::errors::AppError::Throttled`] so the
/// shared rate limiter can react; every other transport or parse failure is
/// `ProviderUnavailable`. "No match" is an empty list or `None`, never an error.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str) -> AppResult<Vec<PlaceCandidate>>;

    async fn reverse(&self, lat: f64, lon: f64) -> AppResult<Option<PlaceCandidate>>;

    async fn forward(&self, city: &str, country: &str) -> AppResult<Option<PlaceCandidate>>;
}

pub fn provider_from_config(config: &AppConfig) -> AppResult<Arc<dyn GeoProvider>> {
    if config.offline_provider {
        info!(target: "resolver", "using offline gazetteer provider");
        return Ok(Arc::new(GazetteerProvider::builtin()));
    }
    let provider = NominatimProvider::new(config)?;
    info!(
        target: "resolver",
        base_url = %config.provider_base_url,
        "using nominatim provider"
    );
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_flag_selects_gazetteer() {
        let config = AppConfig {
            offline_provider: true,
            ..AppConfig::default()
        };
        let provider = provider_from_config(&config).unwrap();
        assert_eq!(provider.name(), "gazetteer");

        let online = provider_from_config(&AppConfig::default()).unwrap();
        assert_eq!(online.name(), "nominatim");
    }
}
