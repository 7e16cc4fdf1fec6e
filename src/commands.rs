use serde::Serialize;
use tracing::warn;

use crate::cache::CacheStats;
use crate::config::PublicAppConfig;
use crate::errors::AppError;
use crate::model::{PlaceCandidate, ResolvedLocation, SaveInput};
use crate::rate_limit::RateBudgetSnapshot;
use crate::LocationService;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub provider: String,
    pub db_path: Option<String>,
    pub rate_budget: RateBudgetSnapshot,
    pub cache: CacheStats,
    pub config: PublicAppConfig,
}

pub async fn search_places(
    service: &LocationService,
    query: String,
) -> Result<Vec<PlaceCandidate>, String> {
    service
        .resolver()
        .search(&query)
        .await
        .map_err(|err| command_error("search_places", err))
}

pub async fn reverse_geocode(
    service: &LocationService,
    lat: f64,
    lon: f64,
) -> Result<Option<PlaceCandidate>, String> {
    service
        .resolver()
        .reverse(lat, lon)
        .await
        .map_err(|err| command_error("reverse_geocode", err))
}

pub async fn save_location(
    service: &LocationService,
    story_id: String,
    input: SaveInput,
) -> Result<ResolvedLocation, String> {
    service
        .resolver()
        .save(&story_id, input)
        .await
        .map_err(|err| command_error("save_location", err))
}

pub async fn get_location(
    service: &LocationService,
    story_id: String,
) -> Result<Option<ResolvedLocation>, String> {
    service
        .resolver()
        .get(&story_id)
        .map_err(|err| command_error("get_location", err))
}

pub fn service_health(service: &LocationService) -> ServiceHealth {
    service.health()
}

fn command_error(command: &str, err: AppError) -> String {
    if !matches!(err, AppError::InvalidInput(_)) {
        warn!(command, ?err, "location command failed");
    }
    err.user_message()
}
