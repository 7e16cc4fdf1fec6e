use async_trait::async_trait;

use crate::errors::AppResult;
use crate::model::PlaceCandidate;
use crate::provider::GeoProvider;
use crate::scoring::{AddressQuality, ConfidenceScorer};

const PROVIDER_NAME: &str = "gazetteer";
const EARTH_RADIUS_KM: f64 = 6371.0088;
const REVERSE_RADIUS_KM: f64 = 25.0;
const SEARCH_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct GazetteerEntry {
    pub id: String,
    pub place_name: String,
    pub city: String,
    pub admin: String,
    pub country: String,
    pub country_code: String,
    pub lat: f64,
    pub lon: f64,
}

impl GazetteerEntry {
    fn label(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for part in [&self.place_name, &self.city, &self.admin, &self.country] {
            if !part.is_empty() && !parts.contains(&part.as_str()) {
                parts.push(part);
            }
        }
        parts.join(", ")
    }

    fn is_point_of_interest(&self) -> bool {
        !self.place_name.is_empty() && self.place_name != self.city
    }
}

/// Offline provider over a fixed in-memory list of places.
pub struct GazetteerProvider {
    entries: Vec<GazetteerEntry>,
    scorer: ConfidenceScorer,
}

impl GazetteerProvider {
    pub fn new(entries: Vec<GazetteerEntry>) -> Self {
        Self {
            entries,
            scorer: ConfidenceScorer,
        }
    }

    /// A small set of well-known places, enough for offline demos and tests.
    pub fn builtin() -> Self {
        let rows: &[(&str, &str, &str, &str, &str, &str, f64, f64)] = &[
            (
                "gz-dc",
                "",
                "Washington",
                "District of Columbia",
                "United States",
                "US",
                38.9072,
                -77.0369,
            ),
            (
                "gz-kc",
                "John F. Kennedy Center for the Performing Arts",
                "Washington",
                "District of Columbia",
                "United States",
                "US",
                38.8959,
                -77.0559,
            ),
            ("gz-nyc", "", "New York", "New York", "United States", "US", 40.7128, -74.0060),
            ("gz-par", "", "Paris", "Ile-de-France", "France", "FR", 48.8566, 2.3522),
            ("gz-eif", "Tour Eiffel", "Paris", "Ile-de-France", "France", "FR", 48.8584, 2.2945),
            ("gz-lon", "", "London", "England", "United Kingdom", "GB", 51.5074, -0.1278),
            ("gz-ber", "", "Berlin", "Berlin", "Germany", "DE", 52.5200, 13.4050),
            ("gz-rom", "", "Rome", "Lazio", "Italy", "IT", 41.9028, 12.4964),
            ("gz-mad", "", "Madrid", "Community of Madrid", "Spain", "ES", 40.4168, -3.7038),
            ("gz-tyo", "", "Tokyo", "Tokyo", "Japan", "JP", 35.6762, 139.6503),
            ("gz-syd", "", "Sydney", "New South Wales", "Australia", "AU", -33.8688, 151.2093),
            ("gz-rio", "", "Rio de Janeiro", "Rio de Janeiro", "Brazil", "BR", -22.9068, -43.1729),
            ("gz-cai", "", "Cairo", "Cairo Governorate", "Egypt", "EG", 30.0444, 31.2357),
            ("gz-tor", "", "Toronto", "Ontario", "Canada", "CA", 43.6532, -79.3832),
        ];
        Self::new(
            rows.iter()
                .map(
                    |&(id, place_name, city, admin, country, code, lat, lon)| GazetteerEntry {
                        id: id.into(),
                        place_name: place_name.into(),
                        city: city.into(),
                        admin: admin.into(),
                        country: country.into(),
                        country_code: code.into(),
                        lat,
                        lon,
                    },
                )
                .collect(),
        )
    }

    fn to_candidate(&self, entry: &GazetteerEntry) -> PlaceCandidate {
        let quality = AddressQuality {
            is_point_of_interest: entry.is_point_of_interest(),
            ..AddressQuality::default()
        };
        PlaceCandidate {
            label: entry.label(),
            lat: entry.lat,
            lon: entry.lon,
            place_name: entry.place_name.clone(),
            city: entry.city.clone(),
            admin: entry.admin.clone(),
            country: entry.country.clone(),
            country_code: entry.country_code.clone(),
            provider: PROVIDER_NAME.to_string(),
            provider_place_id: entry.id.clone(),
            confidence: self.scorer.score_provider(quality),
        }
    }
}

#[async_trait]
impl GeoProvider for GazetteerProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn search(&self, query: &str) -> AppResult<Vec<PlaceCandidate>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.label().to_lowercase().contains(&needle))
            .take(SEARCH_LIMIT)
            .map(|entry| self.to_candidate(entry))
            .collect())
    }

    async fn reverse(&self, lat: f64, lon: f64) -> AppResult<Option<PlaceCandidate>> {
        let nearest = self
            .entries
            .iter()
            .map(|entry| (haversine_km(lat, lon, entry.lat, entry.lon), entry))
            .filter(|(distance, _)| *distance <= REVERSE_RADIUS_KM)
            .min_by(|a, b| a.0.total_cmp(&b.0));
        Ok(nearest.map(|(_, entry)| {
            let mut candidate = self.to_candidate(entry);
            candidate.lat = lat;
            candidate.lon = lon;
            candidate
        }))
    }

    async fn forward(&self, city: &str, country: &str) -> AppResult<Option<PlaceCandidate>> {
        let city = city.trim();
        let country = country.trim();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.city.eq_ignore_ascii_case(city))
            .filter(|entry| {
                entry.country.eq_ignore_ascii_case(country)
                    || entry.country_code.eq_ignore_ascii_case(country)
            })
            .min_by_key(|entry| entry.is_point_of_interest())
            .map(|entry| self.to_candidate(entry)))
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}
