use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::model::{validate_coordinates, PlaceCandidate};
use crate::provider::GeoProvider;
use crate::scoring::{AddressQuality, ConfidenceScorer};

const PROVIDER_NAME: &str = "nominatim";

const POINT_OF_INTEREST_CATEGORIES: &[&str] = &[
    "amenity", "tourism", "shop", "leisure", "historic", "building", "office", "craft", "railway",
    "aeroway",
];

/// OpenStreetMap Nominatim over HTTP.
pub struct NominatimProvider {
    http: Client,
    base_url: String,
    email: Option<String>,
    search_limit: usize,
    scorer: ConfidenceScorer,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimPlace {
    place_id: Option<Value>,
    lat: Option<Value>,
    lon: Option<Value>,
    display_name: Option<String>,
    name: Option<String>,
    #[serde(alias = "class")]
    category: Option<String>,
    address: Option<NominatimAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    house_number: Option<String>,
    postcode: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    state: Option<String>,
    province: Option<String>,
    region: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

impl NominatimProvider {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(config.provider_timeout())
            .user_agent(config.provider_user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            base_url: config.provider_base_url.trim_end_matches('/').to_string(),
            email: config.provider_email.clone(),
            search_limit: config.provider_search_limit.max(1),
            scorer: ConfidenceScorer,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> AppResult<T> {
        params.push(("format", "jsonv2".into()));
        params.push(("addressdetails", "1".into()));
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|err| AppError::ProviderUnavailable(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!(
                target: "nominatim",
                endpoint,
                retry_after_secs = retry_after.map(|d| d.as_secs()),
                "rate limited by provider"
            );
            return Err(AppError::Throttled { retry_after });
        }
        if !status.is_success() {
            return Err(AppError::ProviderUnavailable(format!(
                "{endpoint} returned HTTP {status}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| AppError::ProviderUnavailable(format!("malformed response: {err}")))
    }

    fn to_candidate(&self, place: NominatimPlace) -> Option<PlaceCandidate> {
        let lat = coordinate(place.lat.as_ref())?;
        let lon = coordinate(place.lon.as_ref())?;
        validate_coordinates(lat, lon).ok()?;
        let address = place.address.unwrap_or_default();
        let quality = AddressQuality {
            has_postal_code: present(&address.postcode),
            has_house_number: present(&address.house_number),
            is_point_of_interest: place
                .category
                .as_deref()
                .is_some_and(|category| POINT_OF_INTEREST_CATEGORIES.contains(&category)),
        };

        let city = first_present([
            &address.city,
            &address.town,
            &address.village,
            &address.municipality,
        ]);
        let admin = first_present([&address.state, &address.province, &address.region]);

        Some(PlaceCandidate {
            label: place.display_name.unwrap_or_default(),
            lat,
            lon,
            place_name: place.name.unwrap_or_default(),
            city,
            admin,
            country: address.country.unwrap_or_default(),
            country_code: address.country_code.unwrap_or_default().to_ascii_uppercase(),
            provider: PROVIDER_NAME.to_string(),
            provider_place_id: place.place_id.map(id_string).unwrap_or_default(),
            confidence: self.scorer.score_provider(quality),
        })
    }
}

#[async_trait]
impl GeoProvider for NominatimProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn search(&self, query: &str) -> AppResult<Vec<PlaceCandidate>> {
        let places: Vec<NominatimPlace> = self
            .get_json(
                "search",
                vec![
                    ("q", query.to_string()),
                    ("limit", self.search_limit.to_string()),
                ],
            )
            .await?;
        let total = places.len();
        let candidates: Vec<PlaceCandidate> = places
            .into_iter()
            .filter_map(|place| self.to_candidate(place))
            .collect();
        if candidates.len() < total {
            debug!(
                target: "nominatim",
                dropped = total - candidates.len(),
                "skipped results without usable coordinates"
            );
        }
        Ok(candidates)
    }

    async fn reverse(&self, lat: f64, lon: f64) -> AppResult<Option<PlaceCandidate>> {
        let body: Value = self
            .get_json(
                "reverse",
                vec![("lat", lat.to_string()), ("lon", lon.to_string())],
            )
            .await?;
        if let Some(message) = body.get("error") {
            debug!(target: "nominatim", error = %message, lat, lon, "no reverse result");
            return Ok(None);
        }
        let place: NominatimPlace = serde_json::from_value(body)
            .map_err(|err| AppError::ProviderUnavailable(format!("malformed response: {err}")))?;
        match self.to_candidate(place) {
            Some(candidate) => Ok(Some(candidate)),
            None => Err(AppError::ProviderUnavailable(
                "reverse result has no usable coordinates".into(),
            )),
        }
    }

    async fn forward(&self, city: &str, country: &str) -> AppResult<Option<PlaceCandidate>> {
        let places: Vec<NominatimPlace> = self
            .get_json(
                "search",
                vec![
                    ("q", format!("{city}, {country}")),
                    ("limit", "1".into()),
                ],
            )
            .await?;
        Ok(places
            .into_iter()
            .find_map(|place| self.to_candidate(place)))
    }
}

fn coordinate(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn id_string(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn first_present<const N: usize>(values: [&Option<String>; N]) -> String {
    values
        .into_iter()
        .find(|value| present(value))
        .and_then(|value| value.clone())
        .unwrap_or_default()
}
