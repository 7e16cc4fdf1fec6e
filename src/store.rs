use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::trace;

use crate::db;
use crate::errors::{AppError, AppResult};
use crate::model::{LocationSource, ResolvedLocation};

/// Persistence for one resolved location per story.
pub trait PlaceStore: Send + Sync {
    fn get(&self, story_id: &str) -> AppResult<Option<ResolvedLocation>>;

    /// Full replace of the record for `story_id`; the stored `created_at` of an
    /// existing record survives. Returns the record as persisted.
    fn put(&self, story_id: &str, location: ResolvedLocation) -> AppResult<ResolvedLocation>;
}

#[derive(Clone)]
pub struct SqlitePlaceStore {
    db: Arc<Mutex<Connection>>,
}

impl SqlitePlaceStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn in_memory() -> AppResult<Self> {
        Ok(Self::new(Arc::new(Mutex::new(db::open_in_memory()?))))
    }
}

impl PlaceStore for SqlitePlaceStore {
    fn get(&self, story_id: &str) -> AppResult<Option<ResolvedLocation>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT story_id, lat, lon, place_name, city, admin, country, country_code,
                provider, provider_place_id, confidence, source, created_at, updated_at
            FROM story_places
            WHERE story_id = ?1",
            [story_id],
            parse_location,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn put(&self, story_id: &str, mut location: ResolvedLocation) -> AppResult<ResolvedLocation> {
        location.story_id = story_id.to_string();
        let conn = self.db.lock();
        // The lock serializes writers, so the read-then-write below cannot
        // interleave with another put for the same story.
        let existing_created: Option<String> = conn
            .query_row(
                "SELECT created_at FROM story_places WHERE story_id = ?1",
                [story_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(created) = existing_created {
            location.created_at = parse_timestamp(&created)?;
        }

        conn.execute(
            "INSERT INTO story_places (story_id, lat, lon, place_name, city, admin, country,
                country_code, provider, provider_place_id, confidence, source,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(story_id) DO UPDATE SET
                lat = excluded.lat,
                lon = excluded.lon,
                place_name = excluded.place_name,
                city = excluded.city,
                admin = excluded.admin,
                country = excluded.country,
                country_code = excluded.country_code,
                provider = excluded.provider,
                provider_place_id = excluded.provider_place_id,
                confidence = excluded.confidence,
                source = excluded.source,
                updated_at = excluded.updated_at",
            rusqlite::params![
                location.story_id,
                location.lat,
                location.lon,
                location.place_name,
                location.city,
                location.admin,
                location.country,
                location.country_code,
                location.provider,
                location.provider_place_id,
                location.confidence,
                location.source.as_str(),
                location.created_at.to_rfc3339(),
                location.updated_at.to_rfc3339(),
            ],
        )?;

        trace!(
            target: "place_store",
            story_id,
            source = location.source.as_str(),
            "story location written"
        );
        Ok(location)
    }
}

fn parse_location(row: &Row<'_>) -> rusqlite::Result<ResolvedLocation> {
    let source: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    Ok(ResolvedLocation {
        story_id: row.get(0)?,
        lat: row.get(1)?,
        lon: row.get(2)?,
        place_name: row.get(3)?,
        city: row.get(4)?,
        admin: row.get(5)?,
        country: row.get(6)?,
        country_code: row.get(7)?,
        provider: row.get(8)?,
        provider_place_id: row.get(9)?,
        confidence: row.get(10)?,
        source: LocationSource::parse(&source).map_err(|err| conversion_error(11, err))?,
        created_at: parse_timestamp(&created_at).map_err(|err| conversion_error(12, err))?,
        updated_at: parse_timestamp(&updated_at).map_err(|err| conversion_error(13, err))?,
    })
}

fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| AppError::Config(format!("invalid stored timestamp {value:?}: {err}")))
}

fn conversion_error(column: usize, err: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(err),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::bootstrap;

    fn location(story_id: &str, city: &str, at: DateTime<Utc>) -> ResolvedLocation {
        ResolvedLocation {
            story_id: story_id.into(),
            lat: 48.8584,
            lon: 2.2945,
            place_name: "Tour Eiffel".into(),
            city: city.into(),
            admin: "Ile-de-France".into(),
            country: "France".into(),
            country_code: "FR".into(),
            provider: "nominatim".into(),
            provider_place_id: "5013364".into(),
            confidence: 0.8,
            source: LocationSource::SearchSelection,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn missing_story_reads_as_none() {
        let store = SqlitePlaceStore::in_memory().unwrap();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = SqlitePlaceStore::in_memory().unwrap();
        let now = Utc::now();
        let written = store.put("story-1", location("story-1", "Paris", now)).unwrap();
        let read = store.get("story-1").unwrap().unwrap();
        assert_eq!(read.lat, written.lat);
        assert_eq!(read.lon, written.lon);
        assert_eq!(read.city, "Paris");
        assert_eq!(read.source, LocationSource::SearchSelection);
    }

    #[test]
    fn later_put_replaces_but_keeps_created_at() {
        let store = SqlitePlaceStore::in_memory().unwrap();
        let first_at = Utc::now() - Duration::hours(2);
        store
            .put("story-1", location("story-1", "Paris", first_at))
            .unwrap();

        let mut edit = location("story-1", "Versailles", Utc::now());
        edit.source = LocationSource::UserForm;
        edit.confidence = 0.9;
        edit.place_name.clear();
        let stored = store.put("story-1", edit).unwrap();

        let read = store.get("story-1").unwrap().unwrap();
        assert_eq!(read.city, "Versailles");
        assert_eq!(read.place_name, "");
        assert_eq!(read.source, LocationSource::UserForm);
        assert_eq!(
            read.created_at.timestamp_millis(),
            first_at.timestamp_millis()
        );
        assert_eq!(stored.created_at, read.created_at);
        assert!(read.updated_at > read.created_at);
    }

    #[test]
    fn stories_are_independent() {
        let store = SqlitePlaceStore::in_memory().unwrap();
        let now = Utc::now();
        store.put("a", location("a", "Paris", now)).unwrap();
        store.put("b", location("b", "Lyon", now)).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().city, "Paris");
        assert_eq!(store.get("b").unwrap().unwrap().city, "Lyon");
    }

    #[test]
    fn persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ctx = bootstrap(dir.path(), "places.db").unwrap();
            let store = SqlitePlaceStore::new(Arc::new(Mutex::new(ctx.connection)));
            store
                .put("story-9", location("story-9", "Paris", Utc::now()))
                .unwrap();
        }
        let ctx = bootstrap(dir.path(), "places.db").unwrap();
        let store = SqlitePlaceStore::new(Arc::new(Mutex::new(ctx.connection)));
        assert_eq!(store.get("story-9").unwrap().unwrap().city, "Paris");
    }
}
