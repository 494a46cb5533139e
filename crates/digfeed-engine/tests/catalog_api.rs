//! Catalog client and rate-limited client against a mock HTTP server.

use digfeed_engine::catalog::{CatalogApi, DiscogsCatalog};
use digfeed_engine::{FeedError, RateLimitedClient, RetryPolicy};
use digfeed_proto::protocol::CatalogFilter;
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> RateLimitedClient {
    RateLimitedClient::new("digfeed-test", Duration::ZERO).unwrap()
}

fn jazz() -> CatalogFilter {
    CatalogFilter {
        genre: Some("Jazz".into()),
        era: Some("1959".into()),
        ..Default::default()
    }
}

fn search_body() -> serde_json::Value {
    json!({
        "pagination": {"page": 3, "pages": 120, "per_page": 50, "items": 6000},
        "results": [
            {
                "id": 1,
                "title": "Miles Davis - Kind Of Blue",
                "year": "1959",
                "cover_image": "https://img.example/kob.jpg",
                "uri": "/release/1-Kind-Of-Blue"
            },
            {
                "id": 2,
                "title": "Dave Brubeck Quartet, The - Time Out",
                "year": 1959,
                "thumb": "https://img.example/to.jpg"
            }
        ]
    })
}

#[tokio::test]
async fn test_search_sends_filter_and_paging() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/database/search"))
        .and(query_param("type", "release"))
        .and(query_param("genre", "Jazz"))
        .and(query_param("year", "1959"))
        .and(query_param("page", "3"))
        .and(query_param("per_page", "50"))
        .and(header("Authorization", "Discogs token=secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body()))
        .expect(1)
        .mount(&server)
        .await;

    let catalog = DiscogsCatalog::new(
        client().with_authorization("Discogs token=secret"),
        server.uri(),
    );
    let page = catalog.search(&jazz(), 3, 50).await.unwrap();

    assert_eq!(page.total_items, 6000);
    assert_eq!(page.total_pages, 120);
    assert_eq!(page.hits.len(), 2);
    assert_eq!(page.hits[0].id, "1");
    assert_eq!(page.hits[0].artist, "Miles Davis");
    assert_eq!(page.hits[0].title, "Kind Of Blue");
    assert_eq!(page.hits[0].year, Some(1959));
    assert_eq!(
        page.hits[0].detail_url.as_deref(),
        Some("https://www.discogs.com/release/1-Kind-Of-Blue")
    );
    assert_eq!(page.hits[1].cover_url.as_deref(), Some("https://img.example/to.jpg"));
}

#[tokio::test]
async fn test_release_detail_embeds_video_ids() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "title": "Future Days",
            "artists": [{"name": "Can"}],
            "year": 1973,
            "images": [{"uri": "https://img.example/fd.jpg"}],
            "videos": [
                {"uri": "https://www.youtube.com/watch?v=AAAAAAAAAAA", "title": "Future Days"},
                {"uri": "https://www.youtube.com/watch?v=BBBBBBBBBBB", "title": "Moonshake"}
            ]
        })))
        .mount(&server)
        .await;

    let catalog = DiscogsCatalog::new(client(), server.uri());
    let item = catalog.item("42").await.unwrap();

    assert_eq!(item.artist, "Can");
    assert_eq!(item.year, Some(1973));
    assert_eq!(item.media_ids, vec!["AAAAAAAAAAA", "BBBBBBBBBBB"]);
    assert!(item.has_embedded_media());
}

#[tokio::test]
async fn test_status_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases/404"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Release not found."))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/releases/429"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/releases/401"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/releases/502"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/releases/7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let catalog = DiscogsCatalog::new(client(), server.uri());

    assert!(matches!(catalog.item("404").await, Err(FeedError::NotFound(_))));
    assert_eq!(
        catalog.item("429").await,
        Err(FeedError::RateLimited {
            retry_after: Some(Duration::from_secs(3))
        })
    );
    assert!(matches!(catalog.item("401").await, Err(FeedError::Auth(_))));
    assert!(matches!(catalog.item("502").await, Err(FeedError::Transient(_))));
    assert!(matches!(catalog.item("7").await, Err(FeedError::Decode(_))));
    // Never reaches the server
    assert!(matches!(catalog.item("../x").await, Err(FeedError::NotFound(_))));
}

#[tokio::test]
async fn test_retry_policy_recovers_from_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/database/search"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/database/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body()))
        .mount(&server)
        .await;

    let catalog = DiscogsCatalog::new(client(), server.uri());
    let policy = RetryPolicy {
        max_attempts: 3,
        rate_limit_base: Duration::from_millis(10),
        transient_base: Duration::from_millis(10),
        multiplier: 1.0,
        max_backoff: Duration::from_millis(50),
    };
    let filter = jazz();
    let page = policy
        .run("search", || catalog.search(&filter, 1, 50))
        .await
        .unwrap();

    assert_eq!(page.hits.len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_client_spaces_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "title": "X"})))
        .mount(&server)
        .await;

    let client = RateLimitedClient::new("digfeed-test", Duration::from_millis(150)).unwrap();
    // Clones share the same gate
    let a = DiscogsCatalog::new(client.clone(), server.uri());
    let b = DiscogsCatalog::new(client, server.uri());

    let start = Instant::now();
    a.item("1").await.unwrap();
    b.item("1").await.unwrap();
    a.item("1").await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
}
