//! HTTP server: dashboard layout API and static files.
//!
//! | Path                 | Method  | Behaviour                                  |
//! |----------------------|---------|--------------------------------------------|
//! | `/api/layout`        | GET     | saved layout, or `{}`                      |
//! | `/api/layout/save`   | POST    | store body as the layout (400 / 500)       |
//! | `/api/*`             | OPTIONS | 204, CORS headers only                     |
//! | `/api/*`             | other   | 404                                        |
//! | `/`                  | GET     | `index.html` from the HTML directory       |
//! | `/vendor/*`          | GET     | vendor directory                           |
//! | everything else      | GET     | HTML directory                             |
//!
//! Every `/api` response carries permissive CORS headers so a dashboard
//! served by a development server on another port can still talk to us.
//! Every response carries `Cache-Control: no-cache`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::domain::config::BridgeConfig;
use crate::infrastructure::layout_store::LayoutStore;

const CORS_ALLOW_HEADERS: &str = "Content-Type, Depth, User-Agent, X-File-Size, \
     X-Requested-With, X-Requested-By, If-Modified-Since, X-File-Name, Cache-Control";
const CORS_ALLOW_METHODS: &str = "GET,PUT,POST,DELETE,OPTIONS";

/// Directories and files the HTTP server needs.
#[derive(Debug, Clone)]
pub struct HttpPaths {
    pub html_dir: PathBuf,
    pub vendor_dir: PathBuf,
    pub layout_file: PathBuf,
}

impl HttpPaths {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            html_dir: config.html_dir.clone(),
            vendor_dir: config.vendor_dir.clone(),
            layout_file: config.layout_path(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Builds the complete HTTP application.
pub fn build_router(paths: &HttpPaths) -> Router {
    let layout = Arc::new(LayoutStore::new(paths.layout_file.clone()));

    let api = Router::new()
        .route(
            "/api/layout",
            get(get_layout).options(preflight).fallback(not_found),
        )
        .route(
            "/api/layout/save",
            post(save_layout).options(preflight).fallback(not_found),
        )
        // The wildcard needs a non-empty remainder; the bare prefix is routed too.
        .route("/api", any(api_fallback))
        .route("/api/", any(api_fallback))
        .route("/api/{*rest}", any(api_fallback))
        .with_state(layout)
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(CORS_ALLOW_HEADERS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(CORS_ALLOW_METHODS),
        ));

    Router::new()
        .route_service("/", ServeFile::new(paths.html_dir.join("index.html")))
        .nest_service("/vendor", ServeDir::new(&paths.vendor_dir))
        .merge(api)
        .fallback_service(ServeDir::new(&paths.html_dir))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Binds `http_bind_addr` and serves until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_http_server(config: &BridgeConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let addr = config.http_bind_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!("dashboard available at http://{addr}/");

    let app = build_router(&HttpPaths::from_config(config));
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(running))
        .await
        .context("HTTP server failed")
}

async fn wait_for_shutdown(running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_layout(State(layout): State<Arc<LayoutStore>>) -> Json<serde_json::Value> {
    let value = tokio::task::spawn_blocking(move || layout.load_or_empty())
        .await
        .unwrap_or_else(|e| {
            warn!("layout read task failed: {e}");
            serde_json::Value::Object(serde_json::Map::new())
        });
    Json(value)
}

async fn save_layout(State(layout): State<Arc<LayoutStore>>, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            warn!("rejected layout save: {e}");
            return (StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")).into_response();
        }
    };

    match tokio::task::spawn_blocking(move || layout.save(&value)).await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(e)) => {
            warn!("layout save failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            warn!("layout save task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn api_fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
