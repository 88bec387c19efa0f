//! HTTP surface sharing the signal port
//!
//! Health and stats, the credential API, the relay-address listing and the
//! two static roots. WebSocket upgrades are intercepted before they reach
//! this router (see [`crate::server`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use beacon_core::HttpConfig;

use crate::credentials::{CredentialError, CredentialStore};
use crate::registry::Registry;

/// Everything the HTTP handlers read from
#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<Registry>,
    pub credentials: Arc<CredentialStore>,
    /// Peers silent for longer than this are left out of `/api/peers`
    pub liveness_window: Duration,
}

/// Build the HTTP router
pub fn router(state: HttpState, config: &HttpConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/api/peers", get(list_peers))
        .route("/api/users/available", get(username_available))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .with_state(state)
        .nest_service("/downloads", ServeDir::new(&config.download_root))
        .fallback_service(ServeDir::new(&config.web_root))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({ "status": "healthy", "peers": state.registry.len() }))
}

async fn stats(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({
        "peers": state.registry.len(),
        "identified": state.registry.identified().len(),
        "users": state.credentials.user_count(),
    }))
}

async fn list_peers(State(state): State<HttpState>) -> Json<Value> {
    let peers = state
        .registry
        .relay_listing(Instant::now(), state.liveness_window);
    Json(json!({ "peers": peers }))
}

#[derive(Deserialize)]
struct AvailabilityQuery {
    username: Option<String>,
}

async fn username_available(
    State(state): State<HttpState>,
    Query(query): Query<AvailabilityQuery>,
) -> Response {
    match query.username {
        Some(username) => Json(json!({
            "available": state.credentials.check_available(&username)
        }))
        .into_response(),
        None => error_response(StatusCode::BAD_REQUEST, "missing username"),
    }
}

#[derive(Deserialize)]
struct CredentialsBody {
    username: String,
    password: String,
}

async fn register(
    State(state): State<HttpState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return rejected_body(rejection),
    };

    match state.credentials.register(&body.username, &body.password) {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "ok": true }))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn login(
    State(state): State<HttpState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return rejected_body(rejection),
    };

    match state.credentials.authenticate(&body.username, &body.password) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => e.into_response(),
    }
}

fn rejected_body(rejection: JsonRejection) -> Response {
    // Oversized bodies keep their 413; every other shape problem is a 400
    let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        StatusCode::BAD_REQUEST
    };
    error_response(status, &rejection.body_text())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for CredentialError {
    fn into_response(self) -> Response {
        match self {
            CredentialError::Conflict => {
                error_response(StatusCode::CONFLICT, "username already taken")
            }
            CredentialError::InvalidCredentials => {
                error_response(StatusCode::UNAUTHORIZED, "invalid username or password")
            }
            CredentialError::Invalid(reason) => error_response(StatusCode::BAD_REQUEST, &reason),
            other => {
                warn!("Credential store failure: {}", other);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PeerHandle, RelayAddr};
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        registry: Arc<Registry>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("web")).unwrap();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("web").join("index.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("files").join("notes.txt"), "notes").unwrap();

        let registry = Arc::new(Registry::new());
        let state = HttpState {
            registry: registry.clone(),
            credentials: Arc::new(CredentialStore::open(dir.path().join("users.json")).unwrap()),
            liveness_window: Duration::from_secs(60),
        };
        let config = HttpConfig {
            web_root: dir.path().join("web"),
            download_root: dir.path().join("files"),
            max_body_bytes: 1024,
            ..Default::default()
        };

        Fixture {
            app: router(state, &config),
            registry,
            _dir: dir,
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    fn json_body(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let f = fixture();
        let (status, body) = call(&f.app, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["status"], "healthy");

        let (_, body) = call(&f.app, get_request("/stats")).await;
        assert_eq!(json_body(&body)["peers"], 0);
        assert_eq!(json_body(&body)["users"], 0);
    }

    #[tokio::test]
    async fn test_peer_listing_excludes_anonymous() {
        let f = fixture();
        let origin = "10.1.1.1:5000".parse().unwrap();

        let (h1, _m1) = PeerHandle::channel(4);
        let named = f.registry.register(h1, origin, None).unwrap();
        f.registry.set_alias(&named, "alice".into());
        f.registry.set_relay_addr(
            &named,
            RelayAddr {
                host: "10.1.1.1".into(),
                port: 7000,
            },
        );

        let (h2, _m2) = PeerHandle::channel(4);
        f.registry
            .register(
                h2,
                origin,
                Some(RelayAddr {
                    host: "10.1.1.2".into(),
                    port: 7001,
                }),
            )
            .unwrap();

        let (_, body) = call(&f.app, get_request("/api/peers")).await;
        let value = json_body(&body);
        let peers = value["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["username"], "alice");
        assert_eq!(peers[0]["host"], "10.1.1.1");
        assert_eq!(peers[0]["port"], 7000);
    }

    #[tokio::test]
    async fn test_credential_endpoints() {
        let f = fixture();
        let creds = r#"{"username":"alice","password":"wonderland"}"#;
        let available = "/api/users/available?username=alice";

        let (_, body) = call(&f.app, get_request(available)).await;
        assert_eq!(json_body(&body)["available"], true);

        let (status, _) = call(&f.app, post_json("/api/register", creds)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(&f.app, post_json("/api/register", creds)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = call(&f.app, get_request(available)).await;
        assert_eq!(json_body(&body)["available"], false);

        let (status, _) = call(&f.app, post_json("/api/login", creds)).await;
        assert_eq!(status, StatusCode::OK);

        let wrong = r#"{"username":"alice","password":"nope"}"#;
        let (status, _) = call(&f.app, post_json("/api/login", wrong)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&f.app, post_json("/api/login", "{x}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json_body(&body)["error"].is_string());

        let (status, _) = call(&f.app, post_json("/api/login", r#"{"username":"a"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&f.app, get_request("/api/users/available")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let f = fixture();
        let big = format!(
            r#"{{"username":"alice","password":"{}"}}"#,
            "x".repeat(4096)
        );
        let (status, _) = call(&f.app, post_json("/api/register", &big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_static_roots() {
        let f = fixture();
        let (status, body) = call(&f.app, get_request("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<html></html>");

        let (status, body) = call(&f.app, get_request("/downloads/notes.txt")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"notes");

        let (status, _) = call(&f.app, get_request("/nope.js")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&f.app, get_request("/downloads/%2e%2e/web/index.html")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let f = fixture();
        let request = Request::builder()
            .method("DELETE")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&f.app, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let f = fixture();
        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://example.com")
            .body(Body::empty())
            .unwrap();
        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/api/login")
            .header(header::ORIGIN, "http://example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = f.app.clone().oneshot(preflight).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }
}
