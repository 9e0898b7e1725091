//! Integration tests for the fetch layer.
//!
//! These tests run the poll loop, the retrying session and indirection
//! expansion against mock HTTP servers.

use std::time::{Duration, Instant};

use datasync::download::{
    DownloadError, FetchClient, FetchOutcome, FetchSettings, PixelTransform, RetryPolicy,
};
use image::{Rgb, RgbImage};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_settings() -> FetchSettings {
    FetchSettings {
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(20),
        poll_timeout: Duration::from_millis(300),
    }
}

fn fast_client() -> FetchClient {
    FetchClient::with_settings("secret", fast_settings()).with_session_policy(
        RetryPolicy::session().with_base_delay(Duration::from_millis(10)),
    )
}

#[tokio::test]
async fn test_existing_destination_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
        .expect(0)
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");
    let destination = dir.path().join("cat.jpg");
    std::fs::write(&destination, b"old").expect("seed file");

    let outcome = fast_client()
        .download_file(&format!("{}/cat.jpg", server.uri()), &destination, None)
        .await
        .expect("skip succeeds");

    assert_eq!(
        outcome,
        FetchOutcome::Skipped {
            path: destination.clone()
        }
    );
    assert_eq!(std::fs::read(&destination).expect("read"), b"old");
}

#[tokio::test]
async fn test_binary_response_is_streamed_to_destination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/1"))
        .and(header("Authorization", "ApiKey secret"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pixels".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");
    let destination = dir.path().join("nested/cat.jpg");

    let outcome = fast_client()
        .download_file(&format!("{}/files/1", server.uri()), &destination, None)
        .await
        .expect("download succeeds");

    assert_eq!(
        outcome,
        FetchOutcome::Written {
            path: destination.clone(),
            bytes: 6
        }
    );
    assert_eq!(std::fs::read(&destination).expect("read"), b"pixels");
}

#[tokio::test]
async fn test_presigned_url_has_no_authorization_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bucket/cat.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");

    fast_client()
        .download_file(
            &format!("{}/bucket/cat.jpg?token=abc", server.uri()),
            &dir.path().join("cat.jpg"),
            None,
        )
        .await
        .expect("download succeeds");

    let requests = server.received_requests().await.expect("recording on");
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_poll_loop_fails_fast_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
        .expect(1)
        .mount(&server)
        .await;
    let settings = FetchSettings {
        poll_interval: Duration::from_secs(2),
        ..fast_settings()
    };
    let client = FetchClient::with_settings("secret", settings);

    let started = Instant::now();
    let result = client.fetch(&format!("{}/missing", server.uri())).await;

    assert!(started.elapsed() < Duration::from_secs(1), "no poll sleep on 4xx");
    match result {
        Err(DownloadError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "gone");
        }
        other => panic!("expected 404, got {other:?}"),
    }
}

#[tokio::test]
async fn test_poll_loop_recovers_from_5xx() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");
    let destination = dir.path().join("frame.png");

    fast_client()
        .download_file(&format!("{}/frame", server.uri()), &destination, None)
        .await
        .expect("poll loop succeeds after 503s");

    assert_eq!(std::fs::read(&destination).expect("read"), b"ok");
    assert_eq!(server.received_requests().await.expect("recording").len(), 3);
}

#[tokio::test]
async fn test_poll_loop_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let result = fast_client()
        .fetch(&format!("{}/never-ready", server.uri()))
        .await;

    assert!(
        matches!(result, Err(DownloadError::Timeout { .. })),
        "expected timeout, got {result:?}"
    );
}

#[tokio::test]
async fn test_retrying_session_recovers_from_503() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/segment.ts"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/segment.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"container".to_vec()))
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");
    let destination = dir.path().join(".0000000.ts");

    let bytes = fast_client()
        .download_with_retry(&format!("{}/segment.ts", server.uri()), &destination)
        .await
        .expect("session retries the 503");

    assert_eq!(bytes, 9);
    assert_eq!(std::fs::read(&destination).expect("read"), b"container");
}

#[tokio::test]
async fn test_retrying_session_gives_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;
    let client = FetchClient::with_settings("secret", fast_settings()).with_session_policy(
        RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(5), 2.0),
    );

    let result = client
        .fetch_with_retry(&format!("{}/segment.ts", server.uri()))
        .await;

    assert!(
        matches!(result, Err(DownloadError::RetriesExhausted { attempts: 2, .. })),
        "got {result:?}"
    );
}

#[tokio::test]
async fn test_retrying_session_does_not_retry_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let result = fast_client()
        .fetch_with_retry(&format!("{}/manifest.txt", server.uri()))
        .await;

    assert!(matches!(
        result,
        Err(DownloadError::HttpStatus { status: 404, .. })
    ));
}

#[tokio::test]
async fn test_indirection_response_expands_into_directory() {
    let server = MockServer::start().await;
    let listing = serde_json::json!({
        "urls": [
            format!("{}/x/a.dcm", server.uri()),
            format!("{}/x/b.dcm", server.uri()),
        ]
    });
    Mock::given(method("GET"))
        .and(path("/items/scan"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing))
        .mount(&server)
        .await;
    for name in ["a", "b"] {
        Mock::given(method("GET"))
            .and(path(format!("/x/{name}.dcm")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(name.as_bytes().to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }
    let dir = TempDir::new().expect("temp dir");
    let destination = dir.path().join("scan.dcm");

    let outcome = fast_client()
        .download_file(&format!("{}/items/scan", server.uri()), &destination, None)
        .await
        .expect("expansion succeeds");

    let expanded = dir.path().join("scan");
    assert_eq!(
        outcome,
        FetchOutcome::Expanded {
            dir: expanded.clone(),
            files: vec![expanded.join("a.dcm"), expanded.join("b.dcm")],
        }
    );
    assert_eq!(std::fs::read(expanded.join("a.dcm")).expect("read a"), b"a");
    assert_eq!(std::fs::read(expanded.join("b.dcm")).expect("read b"), b"b");
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_indirection_sub_files_are_fetched_without_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/scan"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "urls": [format!("{}/store/a.dcm", server.uri())]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/store/a.dcm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a".to_vec()))
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");

    fast_client()
        .download_file(
            &format!("{}/items/scan", server.uri()),
            &dir.path().join("scan.dcm"),
            None,
        )
        .await
        .expect("expansion succeeds");

    let requests = server.received_requests().await.expect("recording on");
    let listing = requests
        .iter()
        .find(|r| r.url.path() == "/items/scan")
        .expect("listing requested");
    let stored = requests
        .iter()
        .find(|r| r.url.path() == "/store/a.dcm")
        .expect("sub-file requested");
    assert!(listing.headers.contains_key("authorization"));
    assert!(!stored.headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_indirection_without_urls_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"files": []})),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");
    let destination = dir.path().join("scan.dcm");

    let result = fast_client()
        .download_file(&format!("{}/items/scan", server.uri()), &destination, None)
        .await;

    assert!(matches!(
        result,
        Err(DownloadError::MalformedResponse { .. })
    ));
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_rg16_transform_runs_after_write() {
    let mut source = RgbImage::new(1, 1);
    source.put_pixel(0, 0, Rgb([128, 0, 0]));
    let mut png = std::io::Cursor::new(Vec::new());
    source
        .write_to(&mut png, image::ImageFormat::Png)
        .expect("encode png");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png.into_inner()))
        .mount(&server)
        .await;
    let dir = TempDir::new().expect("temp dir");
    let destination = dir.path().join("slice.png");

    fast_client()
        .download_file(
            &format!("{}/slice", server.uri()),
            &destination,
            Some(PixelTransform::Rg16ToGrayscale),
        )
        .await
        .expect("download and transform succeed");

    let written = image::open(&destination).expect("decode");
    assert_eq!(written.color(), image::ColorType::L8);
    assert_eq!(written.to_luma8().get_pixel(0, 0)[0], 127);
}
