mod common;

use common::{init_tracing, RSS_FEED};
use feed_ingest::{FailureKind, FetchConfig, FetchDocument, FetchError, HttpFetcher};
use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

fn fetcher(config: FetchConfig) -> HttpFetcher {
    HttpFetcher::new(config).expect("client builds")
}

#[tokio::test]
async fn test_fetch_returns_body_and_metadata() {
    init_tracing();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/feed.xml")
        .match_header("user-agent", "feed-ingest-tests")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(RSS_FEED)
        .create_async()
        .await;

    let config = FetchConfig {
        user_agent: "feed-ingest-tests".to_string(),
        ..FetchConfig::default()
    };
    let url = format!("{}/feed.xml", server.url());
    let document = fetcher(config).fetch(&url).await.unwrap();

    mock.assert_async().await;
    assert_eq!(document.status, 200);
    assert_eq!(document.url, url);
    assert_eq!(document.body, RSS_FEED.as_bytes());
    assert_eq!(document.content_length, RSS_FEED.len());
}

#[tokio::test]
async fn test_non_success_status_is_reported() {
    init_tracing();

    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/gone").with_status(404).create_async().await;

    let url = format!("{}/gone", server.url());
    let error = fetcher(FetchConfig::default()).fetch(&url).await.unwrap_err();

    assert!(matches!(error, FetchError::BadStatus { status: 404, .. }));
    assert!(!error.is_transient());
}

#[tokio::test]
async fn test_declared_oversized_body_is_rejected() {
    init_tracing();

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/huge.xml")
        .with_status(200)
        .with_body("x".repeat(4096))
        .create_async()
        .await;

    let config = FetchConfig {
        max_body_bytes: 1024,
        ..FetchConfig::default()
    };
    let url = format!("{}/huge.xml", server.url());
    let error = fetcher(config).fetch(&url).await.unwrap_err();

    assert!(matches!(error, FetchError::TooLarge { limit: 1024, .. }));
}

#[tokio::test]
async fn test_streamed_oversized_body_is_rejected() {
    init_tracing();

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/stream.xml")
        .with_status(200)
        .with_chunked_body(|w| {
            for _ in 0..8 {
                w.write_all(&[b'y'; 512])?;
            }
            Ok(())
        })
        .create_async()
        .await;

    let config = FetchConfig {
        max_body_bytes: 1024,
        ..FetchConfig::default()
    };
    let url = format!("{}/stream.xml", server.url());
    let error = fetcher(config).fetch(&url).await.unwrap_err();

    assert_eq!(error.kind(), FailureKind::TooLarge);
}

#[tokio::test]
async fn test_silent_server_times_out() {
    init_tracing();

    // Accepts connections into the backlog but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/feed.xml", listener.local_addr().unwrap());

    let config = FetchConfig {
        timeout: Duration::from_millis(300),
        ..FetchConfig::default()
    };
    let error = fetcher(config).fetch(&url).await.unwrap_err();

    assert!(matches!(error, FetchError::Timeout { .. }), "got {:?}", error);
    assert!(error.is_transient());
    drop(listener);
}

#[tokio::test]
async fn test_refused_connection_is_a_connection_failure() {
    init_tracing();

    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let url = format!("http://{}/feed.xml", addr);

    let error = fetcher(FetchConfig::default()).fetch(&url).await.unwrap_err();

    assert_eq!(error.kind(), FailureKind::ConnectionFailure);
}

#[tokio::test]
async fn test_invalid_url_is_a_connection_failure() {
    init_tracing();

    let error = fetcher(FetchConfig::default())
        .fetch("not a url at all")
        .await
        .unwrap_err();

    assert!(matches!(error, FetchError::ConnectionFailure { .. }));
}
