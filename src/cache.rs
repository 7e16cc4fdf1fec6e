use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::model::PlaceCandidate;

/// Decimal places kept when coordinates become part of a reverse key.
/// Five places is roughly 1.1 m at the equator.
pub const COORDINATE_KEY_PRECISION: i32 = 5;

/// Writes between sweeps of expired entries.
const SWEEP_EVERY_WRITES: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Search(String),
    Reverse { lat: i64, lon: i64 },
    Forward { city: String, country: String },
}

impl CacheKey {
    pub fn search(query: &str) -> Self {
        CacheKey::Search(query.trim().to_lowercase())
    }

    pub fn reverse(lat: f64, lon: f64) -> Self {
        CacheKey::Reverse {
            lat: quantize(lat),
            lon: quantize(lon),
        }
    }

    pub fn forward(city: &str, country: &str) -> Self {
        CacheKey::Forward {
            city: city.trim().to_lowercase(),
            country: country.trim().to_lowercase(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            CacheKey::Search(_) => "search",
            CacheKey::Reverse { .. } => "reverse",
            CacheKey::Forward { .. } => "forward",
        }
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        STANDARD_NO_PAD.encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Search(query) => write!(f, "search:{query}"),
            CacheKey::Reverse { lat, lon } => {
                let scale = 10_f64.powi(COORDINATE_KEY_PRECISION);
                let places = COORDINATE_KEY_PRECISION as usize;
                write!(
                    f,
                    "reverse:{:.places$},{:.places$}",
                    *lat as f64 / scale,
                    *lon as f64 / scale
                )
            }
            CacheKey::Forward { city, country } => write!(f, "forward:{city}|{country}"),
        }
    }
}

fn quantize(value: f64) -> i64 {
    (value * 10_f64.powi(COORDINATE_KEY_PRECISION)).round() as i64
}

/// A successful provider answer, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedLookup {
    Candidates(Vec<PlaceCandidate>),
    Place(Option<PlaceCandidate>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: CachedLookup,
    pub expires_at: DateTime<Utc>,
}

/// Storage behind [`ResultCache`]. Entries are written and read whole.
pub trait CacheBackend: Send + Sync {
    fn load(&self, key: &CacheKey) -> AppResult<Option<CacheEntry>>;
    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> AppResult<()>;
    fn remove(&self, key: &CacheKey) -> AppResult<()>;
    fn remove_expired(&self, now: DateTime<Utc>) -> AppResult<usize>;
}

#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn load(&self, key: &CacheKey) -> AppResult<Option<CacheEntry>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> AppResult<()> {
        self.entries.lock().insert(key.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> AppResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn remove_expired(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

pub struct SqliteCacheBackend {
    db: Arc<Mutex<Connection>>,
}

impl SqliteCacheBackend {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

impl CacheBackend for SqliteCacheBackend {
    fn load(&self, key: &CacheKey) -> AppResult<Option<CacheEntry>> {
        let row: Option<(String, i64)> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT payload, expires_at FROM geocode_cache WHERE key_hash = ?1",
                [key.digest()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };
        let Some((payload, expires_ms)) = row else {
            return Ok(None);
        };
        let value: CachedLookup = serde_json::from_str(&payload)?;
        let expires_at = Utc
            .timestamp_millis_opt(expires_ms)
            .single()
            .ok_or_else(|| AppError::Config(format!("invalid cache expiry {expires_ms}")))?;
        Ok(Some(CacheEntry { value, expires_at }))
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> AppResult<()> {
        let payload = serde_json::to_string(&entry.value)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO geocode_cache (key_hash, cache_key, payload, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, DATETIME('now'))
            ON CONFLICT(key_hash) DO UPDATE SET
                payload = excluded.payload,
                expires_at = excluded.expires_at,
                created_at = DATETIME('now')",
            (
                key.digest(),
                key.to_string(),
                payload,
                entry.expires_at.timestamp_millis(),
            ),
        )?;
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM geocode_cache WHERE key_hash = ?1",
            [key.digest()],
        )?;
        Ok(())
    }

    fn remove_expired(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM geocode_cache WHERE expires_at <= ?1",
            [now.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// TTL cache in front of the provider. Backend faults degrade to misses.
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    ttl: chrono::Duration,
    inflight: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
    writes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365)),
            inflight: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()), ttl)
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedLookup> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CachedLookup> {
        let found = match self.backend.load(key) {
            Ok(Some(entry)) if entry.expires_at > now => Some(entry.value),
            Ok(Some(_)) => {
                debug!(
                    target: "result_cache",
                    operation = key.operation(),
                    %key,
                    "cache entry expired"
                );
                if let Err(err) = self.backend.remove(key) {
                    warn!(target: "result_cache", ?err, %key, "expired entry not removed");
                }
                None
            }
            Ok(None) => {
                debug!(target: "result_cache", operation = key.operation(), %key, "cache miss");
                None
            }
            Err(err) => {
                warn!(target: "result_cache", ?err, %key, "cache read failed; treating as miss");
                None
            }
        };
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn put(&self, key: &CacheKey, value: CachedLookup) {
        self.put_at(key, value, Utc::now());
    }

    pub fn put_at(&self, key: &CacheKey, value: CachedLookup, now: DateTime<Utc>) {
        let entry = CacheEntry {
            value,
            expires_at: now + self.ttl,
        };
        if let Err(err) = self.backend.store(key, &entry) {
            warn!(target: "result_cache", ?err, %key, "cache write failed; result not cached");
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            let removed = self.purge_expired_at(now);
            debug!(target: "result_cache", removed, "swept expired cache entries");
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        match self.backend.remove_expired(now) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(target: "result_cache", ?err, "cache purge failed");
                0
            }
        }
    }

    /// Serializes work on one key so concurrent misses issue a single
    /// upstream call. Holders must re-check the cache after acquiring.
    pub async fn single_flight(&self, key: &CacheKey) -> FlightGuard<'_> {
        let slot = {
            let mut inflight = self.inflight.lock();
            release_idle_slots(&mut inflight);
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = slot.lock_owned().await;
        FlightGuard {
            cache: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

pub struct FlightGuard<'a> {
    cache: &'a ResultCache,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        release_idle_slots(&mut self.cache.inflight.lock());
    }
}

/// Drops slots that only the map still references. A waiter cancelled while
/// parked on a slot leaves it behind; the next flight or release clears it.
fn release_idle_slots(inflight: &mut HashMap<CacheKey, Arc<AsyncMutex<()>>>) {
    inflight.retain(|_, slot| Arc::strong_count(slot) > 1);
}
