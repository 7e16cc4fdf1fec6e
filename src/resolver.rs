use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStats, CachedLookup, ResultCache};
use crate::errors::{AppError, AppResult};
use crate::model::{
    normalize_query, validate_coordinates, LocationFields, LocationSource, PlaceCandidate,
    ResolvedLocation, SaveInput,
};
use crate::provider::GeoProvider;
use crate::rate_limit::{RateBudgetSnapshot, RateLimiter};
use crate::scoring::ConfidenceScorer;
use crate::store::PlaceStore;

const MAX_FORWARD_PART_CHARS: usize = 100;

/// Coordinates plus descriptive fields ready to be persisted.
struct Draft {
    lat: f64,
    lon: f64,
    fields: LocationFields,
    provider: String,
    provider_place_id: String,
    confidence: f64,
    source: LocationSource,
}

pub struct LocationResolver {
    provider: Arc<dyn GeoProvider>,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache>,
    store: Arc<dyn PlaceStore>,
    scorer: ConfidenceScorer,
    patience: Duration,
}

impl LocationResolver {
    pub fn new(
        provider: Arc<dyn GeoProvider>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResultCache>,
        store: Arc<dyn PlaceStore>,
        patience: Duration,
    ) -> Self {
        Self {
            provider,
            limiter,
            cache,
            store,
            scorer: ConfidenceScorer,
            patience,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn rate_budget(&self) -> RateBudgetSnapshot {
        self.limiter.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    pub async fn search(&self, query: &str) -> AppResult<Vec<PlaceCandidate>> {
        self.search_within(query, self.patience).await
    }

    pub async fn search_within(
        &self,
        query: &str,
        patience: Duration,
    ) -> AppResult<Vec<PlaceCandidate>> {
        let Some(query) = normalize_query(query)? else {
            return Ok(Vec::new());
        };
        let key = CacheKey::search(query);
        let found = self
            .cached_lookup(&key, patience, async {
                self.provider
                    .search(query)
                    .await
                    .map(CachedLookup::Candidates)
            })
            .await?;
        Ok(match found {
            CachedLookup::Candidates(list) => list,
            CachedLookup::Place(place) => place.into_iter().collect(),
        })
    }

    /// Describes a point. Provider trouble degrades to a zero-confidence
    /// candidate at the same coordinates; only bad input is an error.
    pub async fn reverse(&self, lat: f64, lon: f64) -> AppResult<Option<PlaceCandidate>> {
        self.reverse_within(lat, lon, self.patience).await
    }

    pub async fn reverse_within(
        &self,
        lat: f64,
        lon: f64,
        patience: Duration,
    ) -> AppResult<Option<PlaceCandidate>> {
        validate_coordinates(lat, lon)?;
        match self.lookup_reverse(lat, lon, patience).await {
            Ok(found) => Ok(found),
            Err(err) => {
                warn!(
                    target: "resolver",
                    ?err,
                    lat,
                    lon,
                    "reverse lookup failed; returning bare coordinates"
                );
                Ok(Some(PlaceCandidate::degraded(lat, lon)))
            }
        }
    }

    pub async fn forward(&self, city: &str, country: &str) -> AppResult<Option<PlaceCandidate>> {
        self.forward_within(city, country, self.patience).await
    }

    pub async fn forward_within(
        &self,
        city: &str,
        country: &str,
        patience: Duration,
    ) -> AppResult<Option<PlaceCandidate>> {
        let city = city.trim();
        let country = country.trim();
        if city.is_empty() || country.is_empty() {
            return Err(AppError::invalid("city and country are both required"));
        }
        if city.chars().count() > MAX_FORWARD_PART_CHARS
            || country.chars().count() > MAX_FORWARD_PART_CHARS
        {
            return Err(AppError::invalid(format!(
                "city and country must be at most {MAX_FORWARD_PART_CHARS} characters"
            )));
        }
        let key = CacheKey::forward(city, country);
        let found = self
            .cached_lookup(&key, patience, async {
                self.provider
                    .forward(city, country)
                    .await
                    .map(CachedLookup::Place)
            })
            .await?;
        Ok(first_place(found))
    }

    pub fn get(&self, story_id: &str) -> AppResult<Option<ResolvedLocation>> {
        self.store.get(story_id.trim())
    }

    /// Commits a location to a story, replacing any previous one.
    ///
    /// Supplied values stay authoritative. When coordinates and a country are
    /// both present they are cross-checked with a reverse lookup and a
    /// disagreement only lowers the recorded confidence.
    pub async fn save(&self, story_id: &str, input: SaveInput) -> AppResult<ResolvedLocation> {
        let story_id = story_id.trim();
        if story_id.is_empty() {
            return Err(AppError::invalid("storyId is required"));
        }

        let draft = match input {
            SaveInput::SearchSelection(candidate) => {
                self.draft_from_candidate(candidate, LocationSource::SearchSelection)
                    .await?
            }
            SaveInput::ReverseGeocode(candidate) => {
                self.draft_from_candidate(candidate, LocationSource::ReverseGeocode)
                    .await?
            }
            SaveInput::Fields(fields) => self.draft_from_fields(fields.sanitized()?).await?,
        };

        let now = Utc::now();
        let location = ResolvedLocation {
            story_id: story_id.to_string(),
            lat: draft.lat,
            lon: draft.lon,
            place_name: draft.fields.place_name,
            city: draft.fields.city,
            admin: draft.fields.admin,
            country: draft.fields.country,
            country_code: draft.fields.country_code,
            provider: draft.provider,
            provider_place_id: draft.provider_place_id,
            confidence: draft.confidence,
            source: draft.source,
            created_at: now,
            updated_at: now,
        };
        let stored = self.store.put(story_id, location)?;
        info!(
            target: "resolver",
            story_id,
            source = stored.source.as_str(),
            confidence = stored.confidence,
            "story location saved"
        );
        Ok(stored)
    }

    async fn draft_from_candidate(
        &self,
        candidate: PlaceCandidate,
        source: LocationSource,
    ) -> AppResult<Draft> {
        validate_coordinates(candidate.lat, candidate.lon)?;
        let fields = LocationFields::from_candidate(&candidate);
        let mut confidence = self.scorer.score_save(source, Some(candidate.confidence));
        // A reverse-geocode candidate already is the reverse answer for its point.
        if source != LocationSource::ReverseGeocode {
            confidence = self
                .cross_validate(candidate.lat, candidate.lon, &fields, confidence)
                .await;
        }
        Ok(Draft {
            lat: candidate.lat,
            lon: candidate.lon,
            fields,
            provider: candidate.provider,
            provider_place_id: candidate.provider_place_id,
            confidence,
            source,
        })
    }

    async fn draft_from_fields(&self, mut fields: LocationFields) -> AppResult<Draft> {
        let source = fields.origin.source();
        let mut provider = String::new();
        let mut provider_place_id = String::new();

        let (lat, lon, confidence) = match fields.coordinates() {
            Some((lat, lon)) if !fields.has_descriptive_fields() => {
                let described = self.reverse_within(lat, lon, self.patience).await?;
                if let Some(found) = described.filter(|found| !found.is_degraded()) {
                    fill_empty(&mut fields, &LocationFields::from_candidate(&found));
                    provider = found.provider;
                    provider_place_id = found.provider_place_id;
                }
                (lat, lon, self.scorer.score_save(source, None))
            }
            Some((lat, lon)) => {
                let confidence = self.scorer.score_save(source, None);
                let confidence = self.cross_validate(lat, lon, &fields, confidence).await;
                (lat, lon, confidence)
            }
            None if fields.has_city_and_country() => {
                let found = self
                    .forward_within(&fields.city, &fields.country, self.patience)
                    .await?
                    .ok_or_else(|| {
                        AppError::invalid(format!(
                            "no place found for {}, {}",
                            fields.city, fields.country
                        ))
                    })?;
                validate_coordinates(found.lat, found.lon)?;
                fill_empty(&mut fields, &LocationFields::from_candidate(&found));
                provider = found.provider;
                provider_place_id = found.provider_place_id;
                (found.lat, found.lon, self.scorer.score_save(source, None))
            }
            None => {
                return Err(AppError::invalid(
                    "either coordinates or both city and country are required",
                ))
            }
        };

        Ok(Draft {
            lat,
            lon,
            fields,
            provider,
            provider_place_id,
            confidence,
            source,
        })
    }

    /// Returns `confidence`, penalized when the point falls in another country
    /// than the one supplied. A failed lookup leaves it unchanged.
    async fn cross_validate(
        &self,
        lat: f64,
        lon: f64,
        fields: &LocationFields,
        confidence: f64,
    ) -> f64 {
        if fields.country.is_empty() && fields.country_code.is_empty() {
            return confidence;
        }
        let observed = match self.lookup_reverse(lat, lon, self.patience).await {
            Ok(Some(found)) if !found.country_code.trim().is_empty() => found,
            Ok(_) => {
                debug!(target: "resolver", lat, lon, "no country for point; skipping cross-check");
                return confidence;
            }
            Err(err) => {
                warn!(
                    target: "resolver",
                    ?err,
                    lat,
                    lon,
                    "cross-check lookup failed; keeping confidence"
                );
                return confidence;
            }
        };

        if country_matches(fields, &observed) {
            return confidence;
        }
        let penalized = self.scorer.apply_mismatch_penalty(confidence);
        warn!(
            target: "resolver",
            lat,
            lon,
            supplied_country = %fields.country,
            supplied_code = %fields.country_code,
            observed_code = %observed.country_code,
            before = confidence,
            after = penalized,
            "coordinates disagree with supplied country"
        );
        penalized
    }

    async fn lookup_reverse(
        &self,
        lat: f64,
        lon: f64,
        patience: Duration,
    ) -> AppResult<Option<PlaceCandidate>> {
        let key = CacheKey::reverse(lat, lon);
        let found = self
            .cached_lookup(&key, patience, async {
                self.provider.reverse(lat, lon).await.map(CachedLookup::Place)
            })
            .await?;
        Ok(first_place(found))
    }

    /// Cache, then single-flight, then the shared rate budget, then the
    /// provider. Only successful answers are cached.
    async fn cached_lookup<F>(
        &self,
        key: &CacheKey,
        patience: Duration,
        call: F,
    ) -> AppResult<CachedLookup>
    where
        F: Future<Output = AppResult<CachedLookup>>,
    {
        if let Some(hit) = self.cache.get(key) {
            debug!(target: "resolver", %key, "cache hit");
            return Ok(hit);
        }

        let deadline = Instant::now() + patience;
        let _flight = timeout(patience, self.cache.single_flight(key))
            .await
            .map_err(|_| AppError::RateLimitTimeout(patience))?;
        if let Some(hit) = self.cache.get(key) {
            debug!(target: "resolver", %key, "cache filled by concurrent lookup");
            return Ok(hit);
        }

        self.limiter
            .acquire(deadline.saturating_duration_since(Instant::now()))
            .await
            .map_err(|_| AppError::RateLimitTimeout(patience))?;

        debug!(target: "resolver", %key, provider = self.provider.name(), "calling provider");
        match call.await {
            Ok(value) => {
                self.limiter.on_success();
                self.cache.put(key, value.clone());
                Ok(value)
            }
            Err(AppError::Throttled { retry_after }) => {
                self.limiter.on_throttled(retry_after);
                Err(AppError::Throttled { retry_after }.into_provider_error())
            }
            Err(err) => {
                warn!(target: "resolver", ?err, %key, "provider lookup failed");
                Err(err.into_provider_error())
            }
        }
    }
}

fn first_place(found: CachedLookup) -> Option<PlaceCandidate> {
    match found {
        CachedLookup::Place(place) => place,
        CachedLookup::Candidates(list) => list.into_iter().next(),
    }
}

fn fill_empty(target: &mut LocationFields, source: &LocationFields) {
    for (slot, value) in [
        (&mut target.place_name, &source.place_name),
        (&mut target.city, &source.city),
        (&mut target.admin, &source.admin),
        (&mut target.country, &source.country),
        (&mut target.country_code, &source.country_code),
    ] {
        if slot.is_empty() {
            slot.clone_from(value);
        }
    }
}

/// The supplied code wins when present; otherwise the supplied country name
/// is compared with both the observed name and code.
fn country_matches(fields: &LocationFields, observed: &PlaceCandidate) -> bool {
    let observed_code = observed.country_code.trim();
    if !fields.country_code.is_empty() {
        return fields.country_code.eq_ignore_ascii_case(observed_code);
    }
    let supplied = fields.country.trim().to_lowercase();
    supplied == observed_code.to_lowercase()
        || (!observed.country.trim().is_empty()
            && supplied == observed.country.trim().to_lowercase())
}
