use std::sync::Arc;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use story_locations::{
    get_location, reverse_geocode, save_location, search_places, service_health, AppConfig,
    FieldOrigin, GazetteerProvider, LocationFields, LocationService, LocationSource, SaveInput,
};

fn kennedy_center() -> serde_json::Value {
    json!({
        "place_id": 297562310,
        "lat": "38.8959",
        "lon": "-77.0559",
        "category": "amenity",
        "type": "theatre",
        "name": "John F. Kennedy Center for the Performing Arts",
        "display_name": "John F. Kennedy Center for the Performing Arts, Washington, District of Columbia, United States",
        "address": {
            "city": "Washington",
            "state": "District of Columbia",
            "postcode": "20566",
            "country": "United States",
            "country_code": "us"
        }
    })
}

fn config_for(server: &Server) -> AppConfig {
    AppConfig {
        provider_base_url: server.url("/").to_string(),
        provider_user_agent: "StoryLocationsTest/1.0".into(),
        provider_timeout_secs: 2,
        cache_persistent: true,
        rate_interval_ms: 5,
        database_file_name: "locations.db".into(),
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn search_save_and_restart_against_nominatim() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "Kennedy Center")))),
            request::headers(contains(("user-agent", "StoryLocationsTest/1.0"))),
        ])
        .times(1)
        .respond_with(json_encoded(json!([kennedy_center()]))),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/reverse"))
            .times(1)
            .respond_with(json_encoded(kennedy_center())),
    );

    let dir = tempdir().unwrap();
    let service = LocationService::initialize(dir.path(), config_for(&server)).unwrap();

    let results = search_places(&service, "Kennedy Center".into()).await.unwrap();
    assert_eq!(results.len(), 1);
    let chosen = results[0].clone();
    assert_eq!(chosen.city, "Washington");
    assert_eq!(chosen.country_code, "US");
    assert!((0.70..=0.95).contains(&chosen.confidence));

    let again = search_places(&service, "kennedy center ".into()).await.unwrap();
    assert_eq!(again, results);

    let saved = save_location(
        &service,
        "story-1".into(),
        SaveInput::SearchSelection(chosen.clone()),
    )
    .await
    .unwrap();
    assert_eq!(saved.source, LocationSource::SearchSelection);
    assert!((saved.confidence - chosen.confidence).abs() < 1e-9);

    let point = reverse_geocode(&service, 38.8959, -77.0559).await.unwrap();
    assert_eq!(point.unwrap().country, "United States");
    drop(service);

    let restarted = LocationService::initialize(dir.path(), config_for(&server)).unwrap();
    let cached = search_places(&restarted, "Kennedy Center".into())
        .await
        .unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].provider_place_id, chosen.provider_place_id);
    assert_eq!((cached[0].lat, cached[0].lon), (chosen.lat, chosen.lon));
    assert!((cached[0].confidence - chosen.confidence).abs() < 1e-9);
    let stored = get_location(&restarted, "story-1".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((stored.lat, stored.lon), (chosen.lat, chosen.lon));
    assert_eq!(stored.city, chosen.city);
    assert_eq!(stored.country, chosen.country);
}

#[tokio::test]
async fn throttled_provider_reads_as_try_again() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .times(1)
            .respond_with(status_code(429).append_header("Retry-After", "2")),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/reverse"))
            .times(1)
            .respond_with(status_code(500)),
    );

    let dir = tempdir().unwrap();
    let config = AppConfig {
        acquire_timeout_ms: 100,
        ..config_for(&server)
    };
    let service = LocationService::initialize(dir.path(), config).unwrap();

    let err = search_places(&service, "Paris".into()).await.unwrap_err();
    assert!(err.contains("try again"), "{err}");
    let health = service_health(&service);
    assert_eq!(health.rate_budget.consecutive_throttles, 1);
    assert!(health.rate_budget.backoff_remaining_ms > 0);

    // The limiter is still backing off, so the lookup cannot even start.
    let degraded = reverse_geocode(&service, 48.8584, 2.2945)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(degraded.confidence, 0.0);
    assert_eq!((degraded.lat, degraded.lon), (48.8584, 2.2945));

    tokio::time::sleep(std::time::Duration::from_millis(2_100)).await;
    let degraded = reverse_geocode(&service, 48.8584, 2.2945)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(degraded.confidence, 0.0);
}

#[tokio::test]
async fn offline_gazetteer_fills_manual_entries() {
    let dir = tempdir().unwrap();
    let service = LocationService::with_provider(
        dir.path(),
        AppConfig {
            rate_interval_ms: 1,
            ..AppConfig::default()
        },
        Arc::new(GazetteerProvider::builtin()),
    )
    .unwrap();

    let from_city = save_location(
        &service,
        "trip".into(),
        SaveInput::Fields(LocationFields {
            city: "Tokyo".into(),
            country: "Japan".into(),
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    assert_eq!(from_city.country_code, "JP");
    assert_eq!(from_city.source, LocationSource::UserForm);
    assert!((from_city.confidence - 0.90).abs() < 1e-9);
    assert!((from_city.lat - 35.6762).abs() < 1e-6);

    let from_photo = save_location(
        &service,
        "photo".into(),
        SaveInput::Fields(LocationFields {
            lat: Some(-33.87),
            lon: Some(151.21),
            origin: FieldOrigin::Exif,
            ..Default::default()
        }),
    )
    .await
    .unwrap();
    assert_eq!(from_photo.city, "Sydney");
    assert_eq!(from_photo.source, LocationSource::Exif);
    assert_eq!(from_photo.display_label(), "Sydney, New South Wales, Australia");
}
