//! HTTP server implementation using Axum.

use crate::error::SandboxError;
use crate::identity::generate_session_id;
use crate::query::QueryOutput;
use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// Request/Response types
#[derive(Deserialize, Default)]
struct SessionRequest {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct QueryRequest {
    session_id: String,
    query: String,
}

#[derive(Deserialize)]
struct LogoutRequest {
    session_id: String,
}

#[derive(Serialize, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    active_sessions: usize,
    database: String,
}

type ApiError = (StatusCode, String);

/// Build the router: JSON API under `/api`, static frontend everywhere else.
pub fn router(state: AppState, frontend_dir: &Path) -> Router {
    Router::new()
        .route("/api/session", post(create_session))
        .route("/api/query", post(run_query))
        .route("/api/logout", post(logout))
        .route("/api/health", get(health))
        .nest_service("/lite", ServeDir::new(frontend_dir.join("lite")))
        .fallback_service(ServeDir::new(frontend_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server(
    port: u16,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

// Never echo provisioning errors: they can name roles, hosts and databases.
fn internal(e: SandboxError, what: &'static str) -> ApiError {
    error!(error = %e, "{}", what);
    if e.is_connection() {
        (StatusCode::SERVICE_UNAVAILABLE, "database unavailable".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, what.to_string())
    }
}

/// Start a session, or renew the sandbox of an existing one.
///
/// Unknown ids sent by the client are ignored and a new one is issued, so
/// session ids are always generated server side.
async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<SessionRequest>>,
) -> Result<Json<SessionResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let session_id = match req.session_id {
        Some(id) if state.registry.lookup_database(&id).await.is_some() => id,
        _ => generate_session_id(),
    };

    state
        .registry
        .get_or_create_session(&session_id)
        .await
        .map_err(|e| internal(e, "Failed to create sandbox"))?;

    Ok(Json(SessionResponse { session_id }))
}

async fn run_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryOutput>, ApiError> {
    let database = state
        .registry
        .lookup_database(&req.session_id)
        .await
        .ok_or((StatusCode::BAD_REQUEST, "invalid session".to_string()))?;
    state.registry.update_activity(&req.session_id).await;

    let output = state
        .queries
        .run(&database, &req.query)
        .await
        .map_err(|e| internal(e, "Query execution failed"))?;
    Ok(Json(output))
}

async fn logout(
    State(state): State<AppState>,
    Json(req): Json<LogoutRequest>,
) -> Json<StatusResponse> {
    if state.registry.cleanup_session(&req.session_id).await {
        info!(session_id = %req.session_id, "logged out");
    }
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.registry.provisioner().ping().await {
        Ok(()) => "up",
        Err(e) => {
            error!(error = %e, "health check could not reach database");
            "down"
        }
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.registry.active_sessions().await,
        database: database.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::provisioner::fake::FakeProvisioner;
    use crate::query::TenantQueries;
    use crate::registry::SandboxRegistry;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Arc<FakeProvisioner>, AppState, Router) {
        let fake = Arc::new(FakeProvisioner::default());
        let registry = Arc::new(SandboxRegistry::new(fake.clone(), Duration::from_secs(60)));
        let state = AppState::new(registry, TenantQueries::new(&test_config()));
        let router = router(state.clone(), Path::new("./frontend"));
        (fake, state, router)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn session_start_without_body_issues_new_id() {
        let (fake, state, router) = app();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: SessionResponse = body_json(response).await;
        let db = state.registry.lookup_database(&body.session_id).await.unwrap();
        assert!(fake.is_live(&db));
    }

    #[tokio::test]
    async fn session_start_renews_known_session() {
        let (fake, state, router) = app();
        let old = state.registry.get_or_create_session("known").await.unwrap();

        let response = router
            .oneshot(post_json("/api/session", serde_json::json!({"session_id": "known"})))
            .await
            .unwrap();
        let body: SessionResponse = body_json(response).await;

        assert_eq!(body.session_id, "known");
        let new = state.registry.lookup_database("known").await.unwrap();
        assert_ne!(old, new);
        assert!(!fake.is_live(&old));
    }

    #[tokio::test]
    async fn session_start_ignores_client_chosen_ids() {
        let (_fake, state, router) = app();
        let response = router
            .oneshot(post_json("/api/session", serde_json::json!({"session_id": "mine"})))
            .await
            .unwrap();
        let body: SessionResponse = body_json(response).await;

        assert_ne!(body.session_id, "mine");
        assert!(state.registry.lookup_database("mine").await.is_none());
    }

    #[tokio::test]
    async fn failed_provisioning_is_a_generic_500() {
        let (fake, state, router) = app();
        fake.fail_grant.store(true, Ordering::SeqCst);

        let response = router
            .oneshot(post_json("/api/session", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Failed to create sandbox");
        assert_eq!(state.registry.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn query_with_unknown_session_is_rejected() {
        let (_fake, _state, router) = app();
        let response = router
            .oneshot(post_json(
                "/api/query",
                serde_json::json!({"session_id": "nope", "query": "SELECT 1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_removes_session() {
        let (fake, state, router) = app();
        let db = state.registry.get_or_create_session("bye").await.unwrap();

        let response = router
            .clone()
            .oneshot(post_json("/api/logout", serde_json::json!({"session_id": "bye"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.registry.lookup_database("bye").await.is_none());
        assert!(!fake.is_live(&db));

        // Logging out twice is fine.
        let response = router
            .oneshot(post_json("/api/logout", serde_json::json!({"session_id": "bye"})))
            .await
            .unwrap();
        let body: StatusResponse = body_json(response).await;
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let (_fake, state, router) = app();
        state.registry.get_or_create_session("h").await.unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body: HealthResponse = body_json(response).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.active_sessions, 1);
        assert_eq!(body.database, "up");
    }
}
