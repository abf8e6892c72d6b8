//! Integration tests for the layout API, driven through the full axum router
//! with `tower::ServiceExt::oneshot` (no sockets).

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::json;
use tower::ServiceExt;

use tablesync_bridge::infrastructure::{build_router, HttpPaths};

fn app(dir: &std::path::Path) -> Router {
    build_router(&HttpPaths {
        html_dir: dir.join("html"),
        vendor_dir: dir.join("vendor"),
        layout_file: dir.join("dashboard").join("layout.json"),
    })
}

async fn call(app: Router, method: Method, uri: &str, body: &str) -> Response {
    app.oneshot(
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_layout_is_empty_object_before_first_save() {
    let dir = tempfile::tempdir().unwrap();

    let response = call(app(dir.path()), Method::GET, "/api/layout", "").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({}));
}

#[tokio::test]
async fn test_save_then_get_returns_equivalent_json() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let layout = json!({
        "tabs": [{"name": "Teleop", "widgets": [{"key": "/SmartDashboard/speed", "x": 3}]}],
        "version": 2
    });

    // Act
    let saved = call(
        app(dir.path()),
        Method::POST,
        "/api/layout/save",
        &layout.to_string(),
    )
    .await;
    let loaded = call(app(dir.path()), Method::GET, "/api/layout", "").await;

    // Assert
    assert_eq!(saved.status(), StatusCode::OK);
    assert_eq!(body_json(loaded).await, layout);
    let on_disk = std::fs::read_to_string(dir.path().join("dashboard/layout.json")).unwrap();
    assert!(on_disk.contains("\n    \"tabs\""), "4-space indent: {on_disk}");
}

#[tokio::test]
async fn test_malformed_save_body_is_400_and_keeps_old_layout() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    call(app(dir.path()), Method::POST, "/api/layout/save", r#"{"a":1}"#).await;

    // Act
    let response = call(app(dir.path()), Method::POST, "/api/layout/save", "{oops").await;
    let loaded = call(app(dir.path()), Method::GET, "/api/layout", "").await;

    // Assert
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(loaded).await, json!({"a": 1}));
}

#[tokio::test]
async fn test_corrupt_layout_file_reads_as_empty_object() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("dashboard")).unwrap();
    std::fs::write(dir.path().join("dashboard/layout.json"), "not json at all").unwrap();

    let response = call(app(dir.path()), Method::GET, "/api/layout", "").await;

    assert_eq!(body_json(response).await, json!({}));
}

#[tokio::test]
async fn test_unknown_api_paths_are_404_for_any_method() {
    let dir = tempfile::tempdir().unwrap();

    for uri in ["/api/unknown", "/api/", "/api"] {
        for method in [Method::GET, Method::POST, Method::PUT, Method::DELETE] {
            let response = call(app(dir.path()), method.clone(), uri, "").await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }
    }
}

#[tokio::test]
async fn test_preflight_on_bare_api_prefix_is_204() {
    let dir = tempfile::tempdir().unwrap();

    for uri in ["/api/", "/api"] {
        let response = call(app(dir.path()), Method::OPTIONS, uri, "").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT, "OPTIONS {uri}");
    }
}

#[tokio::test]
async fn test_unwritable_layout_path_is_500() {
    // Arrange: make "dashboard" a file so the layout cannot be created under it
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("dashboard"), "in the way").unwrap();

    // Act
    let response = call(app(dir.path()), Method::POST, "/api/layout/save", "{}").await;

    // Assert
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
