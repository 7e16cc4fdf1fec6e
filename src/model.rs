use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

pub const MAX_QUERY_CHARS: usize = 120;
const MAX_PLACE_NAME_CHARS: usize = 255;
const MAX_REGION_CHARS: usize = 100;

/// One candidate place returned by a provider lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceCandidate {
    pub label: String,
    pub lat: f64,
    pub lon: f64,
    pub place_name: String,
    pub city: String,
    pub admin: String,
    pub country: String,
    pub country_code: String,
    pub provider: String,
    pub provider_place_id: String,
    pub confidence: f64,
}

impl PlaceCandidate {
    /// Bare point used when the provider cannot describe a coordinate.
    pub fn degraded(lat: f64, lon: f64) -> Self {
        Self {
            label: format!("{lat:.5}, {lon:.5}"),
            lat,
            lon,
            place_name: String::new(),
            city: String::new(),
            admin: String::new(),
            country: String::new(),
            country_code: String::new(),
            provider: String::new(),
            provider_place_id: String::new(),
            confidence: 0.0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.confidence == 0.0 && self.provider.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    SearchSelection,
    ReverseGeocode,
    UserForm,
    Exif,
}

impl LocationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationSource::SearchSelection => "search_selection",
            LocationSource::ReverseGeocode => "reverse_geocode",
            LocationSource::UserForm => "user_form",
            LocationSource::Exif => "exif",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "search_selection" => Ok(LocationSource::SearchSelection),
            "reverse_geocode" => Ok(LocationSource::ReverseGeocode),
            "user_form" => Ok(LocationSource::UserForm),
            "exif" => Ok(LocationSource::Exif),
            _ => Err(AppError::invalid(format!("unknown location source: {value}"))),
        }
    }
}

/// Persisted, authoritative location of one story or image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLocation {
    pub story_id: String,
    pub lat: f64,
    pub lon: f64,
    pub place_name: String,
    pub city: String,
    pub admin: String,
    pub country: String,
    pub country_code: String,
    pub provider: String,
    pub provider_place_id: String,
    pub confidence: f64,
    pub source: LocationSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResolvedLocation {
    /// "Place, Region, Country" with the region dropped when it repeats the city.
    pub fn display_label(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !self.place_name.is_empty() {
            parts.push(&self.place_name);
        } else if !self.city.is_empty() {
            parts.push(&self.city);
        }
        if !self.admin.is_empty() && self.admin != self.city {
            parts.push(&self.admin);
        }
        if !self.country.is_empty() {
            parts.push(&self.country);
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    #[default]
    UserForm,
    Exif,
}

impl FieldOrigin {
    pub fn source(&self) -> LocationSource {
        match self {
            FieldOrigin::UserForm => LocationSource::UserForm,
            FieldOrigin::Exif => LocationSource::Exif,
        }
    }
}

/// Manually entered (or camera supplied) location fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationFields {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub place_name: String,
    pub city: String,
    pub admin: String,
    pub country: String,
    pub country_code: String,
    pub origin: FieldOrigin,
}

impl LocationFields {
    /// Provider text is clipped to the storage limits rather than rejected;
    /// a malformed country code is dropped.
    pub fn from_candidate(candidate: &PlaceCandidate) -> Self {
        let code = candidate.country_code.trim().to_ascii_uppercase();
        let code_ok = code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic());
        Self {
            lat: Some(candidate.lat),
            lon: Some(candidate.lon),
            place_name: clip(&candidate.place_name, MAX_PLACE_NAME_CHARS),
            city: clip(&candidate.city, MAX_REGION_CHARS),
            admin: clip(&candidate.admin, MAX_REGION_CHARS),
            country: clip(&candidate.country, MAX_REGION_CHARS),
            country_code: if code_ok { code } else { String::new() },
            origin: FieldOrigin::UserForm,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.lat.zip(self.lon)
    }

    pub fn has_city_and_country(&self) -> bool {
        !self.city.trim().is_empty() && !self.country.trim().is_empty()
    }

    pub fn has_descriptive_fields(&self) -> bool {
        [
            &self.place_name,
            &self.city,
            &self.admin,
            &self.country,
            &self.country_code,
        ]
        .iter()
        .any(|value| !value.trim().is_empty())
    }

    /// Trims every text field, upper-cases the country code and enforces limits.
    pub fn sanitized(mut self) -> AppResult<Self> {
        self.place_name = self.place_name.trim().to_string();
        self.city = self.city.trim().to_string();
        self.admin = self.admin.trim().to_string();
        self.country = self.country.trim().to_string();
        self.country_code = self.country_code.trim().to_ascii_uppercase();

        check_length("placeName", &self.place_name, MAX_PLACE_NAME_CHARS)?;
        check_length("city", &self.city, MAX_REGION_CHARS)?;
        check_length("admin", &self.admin, MAX_REGION_CHARS)?;
        check_length("country", &self.country, MAX_REGION_CHARS)?;
        if !self.country_code.is_empty()
            && (self.country_code.len() != 2
                || !self.country_code.chars().all(|c| c.is_ascii_alphabetic()))
        {
            return Err(AppError::invalid(format!(
                "countryCode must be a two-letter ISO code, got {:?}",
                self.country_code
            )));
        }

        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => validate_coordinates(lat, lon)?,
            (None, None) => {}
            _ => {
                return Err(AppError::invalid(
                    "lat and lon must be provided together",
                ))
            }
        }
        Ok(self)
    }
}

/// What a caller commits to a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SaveInput {
    SearchSelection(PlaceCandidate),
    ReverseGeocode(PlaceCandidate),
    Fields(LocationFields),
}

pub fn validate_coordinates(lat: f64, lon: f64) -> AppResult<()> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(AppError::invalid(format!(
            "latitude {lat} outside [-90, 90]"
        )));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(AppError::invalid(format!(
            "longitude {lon} outside [-180, 180]"
        )));
    }
    Ok(())
}

/// Returns the trimmed query, or `None` when there is nothing to look up.
pub fn normalize_query(query: &str) -> AppResult<Option<&str>> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_QUERY_CHARS {
        return Err(AppError::invalid(format!(
            "query longer than {MAX_QUERY_CHARS} characters"
        )));
    }
    Ok(Some(trimmed))
}

fn clip(value: &str, max: usize) -> String {
    value.trim().chars().take(max).collect()
}

fn check_length(field: &str, value: &str, max: usize) -> AppResult<()> {
    if value.chars().count() > max {
        return Err(AppError::invalid(format!(
            "{field} longer than {max} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> ResolvedLocation {
        let now = Utc::now();
        ResolvedLocation {
            story_id: "story-1".into(),
            lat: 38.8959,
            lon: -77.0559,
            place_name: "Kennedy Center".into(),
            city: "Washington".into(),
            admin: "District of Columbia".into(),
            country: "United States".into(),
            country_code: "US".into(),
            provider: "nominatim".into(),
            provider_place_id: "123".into(),
            confidence: 0.8,
            source: LocationSource::SearchSelection,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(validate_coordinates(91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, 181.0).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
        assert!(validate_coordinates(-90.0, 180.0).is_ok());
    }

    #[test]
    fn query_normalization_handles_edges() {
        assert_eq!(normalize_query("   ").unwrap(), None);
        assert_eq!(normalize_query("  paris ").unwrap(), Some("paris"));
        let long = "x".repeat(MAX_QUERY_CHARS + 1);
        assert!(matches!(
            normalize_query(&long),
            Err(AppError::InvalidInput(_))
        ));
        let padded = format!("  {}  ", "y".repeat(MAX_QUERY_CHARS));
        assert!(normalize_query(&padded).unwrap().is_some());
    }

    #[test]
    fn sanitizes_fields() {
        let fields = LocationFields {
            lat: Some(1.0),
            lon: Some(2.0),
            city: "  Paris ".into(),
            country_code: "fr".into(),
            ..Default::default()
        }
        .sanitized()
        .unwrap();
        assert_eq!(fields.city, "Paris");
        assert_eq!(fields.country_code, "FR");

        let half = LocationFields {
            lat: Some(1.0),
            ..Default::default()
        };
        assert!(half.sanitized().is_err());

        let bad_code = LocationFields {
            country_code: "USA".into(),
            ..Default::default()
        };
        assert!(bad_code.sanitized().is_err());
    }

    #[test]
    fn candidate_fields_are_clipped() {
        let mut candidate = PlaceCandidate::degraded(10.0, 20.0);
        candidate.place_name = "n".repeat(300);
        candidate.city = " Lyon ".into();
        candidate.country_code = "fra".into();
        let fields = LocationFields::from_candidate(&candidate);
        assert_eq!(fields.place_name.chars().count(), MAX_PLACE_NAME_CHARS);
        assert_eq!(fields.city, "Lyon");
        assert_eq!(fields.country_code, "");
        assert_eq!(fields.coordinates(), Some((10.0, 20.0)));
    }

    #[test]
    fn display_label_skips_repeated_region() {
        let mut loc = location();
        assert_eq!(
            loc.display_label(),
            "Kennedy Center, District of Columbia, United States"
        );
        loc.place_name.clear();
        loc.admin = "Washington".into();
        assert_eq!(loc.display_label(), "Washington, United States");
    }

    #[test]
    fn serializes_with_wire_names() {
        let value = serde_json::to_value(location()).unwrap();
        assert_eq!(value["source"], "search_selection");
        assert_eq!(value["countryCode"], "US");
        assert!(value.get("providerPlaceId").is_some());

        let input: SaveInput = serde_json::from_value(serde_json::json!({
            "kind": "fields",
            "value": { "lat": 1.5, "lon": 2.5, "city": "Lyon", "country": "France" }
        }))
        .unwrap();
        match input {
            SaveInput::Fields(fields) => {
                assert_eq!(fields.coordinates(), Some((1.5, 2.5)));
                assert_eq!(fields.origin, FieldOrigin::UserForm);
            }
            other => panic!("unexpected input {other:?}"),
        }
    }
}
