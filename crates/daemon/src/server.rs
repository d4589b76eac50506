//! HTTP API
//!
//! JSON-over-HTTP surface for the provisioning service. All endpoints except
//! health and server-info require the shared bearer secret. Error taxonomy is
//! mapped to status codes here; nothing below this layer knows about HTTP.

use crate::config::RelayConfig;
use crate::provision::Provisioner;
use crate::wg::RuntimePeer;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;
use wgrelay_common::{validate_public_key, Error};

/// Shared API state
pub struct AppState {
    provisioner: Arc<Provisioner>,
    config: RelayConfig,
    secret_hash: String,
}

impl AppState {
    pub fn new(provisioner: Arc<Provisioner>, config: RelayConfig) -> Self {
        let secret_hash = hash_token(&config.auth.api_secret);
        Self {
            provisioner,
            config,
            secret_hash,
        }
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = extract_token(headers).ok_or(Error::Unauthorized)?;
    // Digest compare: fixed-width regardless of token length
    if hash_token(token) != state.secret_hash {
        return Err(Error::Unauthorized.into());
    }
    Ok(())
}

// ============================================================================
// Error mapping
// ============================================================================

/// HTTP boundary wrapper for the common error enum
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::PeerNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Capacity { .. } | Error::RuntimeSync(_) | Error::Timeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.0.is_constraint_violation() {
            // Should be impossible under the allocation lock; if it fires,
            // something is racing the allocator.
            error!("store constraint surfaced to API boundary: {}", self.0);
        }

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

// ============================================================================
// Request/response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreatePeerRequest {
    identity: String,
    #[serde(default)]
    label: String,
}

#[derive(Debug, Serialize)]
struct CreatePeerResponse {
    success: bool,
    peer_id: Uuid,
    config: String,
    assigned_address: String,
    public_key: String,
    server_name: String,
    server_ip: String,
}

#[derive(Debug, Deserialize)]
struct RemovePeerRequest {
    public_key: String,
}

#[derive(Debug, Serialize)]
struct RemovePeerResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct ListPeersResponse {
    success: bool,
    peer_count: usize,
    peers: Vec<RuntimePeer>,
}

#[derive(Debug, Deserialize)]
struct GetConfigRequest {
    public_key: String,
}

#[derive(Debug, Serialize)]
struct GetConfigResponse {
    success: bool,
    config: String,
}

#[derive(Debug, Deserialize)]
struct PeerStatusQuery {
    public_key: String,
}

#[derive(Debug, Serialize)]
struct PeerStatusResponse {
    success: bool,
    found: bool,
    peer: Option<RuntimePeer>,
}

// ============================================================================
// Router
// ============================================================================

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/server-info", get(server_info_handler))
        .route("/api/create-peer", post(create_peer_handler))
        .route("/api/remove-peer", post(remove_peer_handler))
        .route("/api/list-peers", get(list_peers_handler))
        .route("/api/get-config", post(get_config_handler))
        .route("/api/peer-status", get(peer_status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on the configured port
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let up = state.provisioner.runtime_up().await;
    Json(serde_json::json!({
        "status": if up { "online" } else { "degraded" },
        "server": state.config.server.name,
        "ip": state.config.server.public_ip,
        "port": state.config.wireguard.listen_port,
        "timestamp": chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

async fn server_info_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let public_key = state.provisioner.server_public_key().await?;
    Ok(Json(serde_json::json!({
        "name": state.config.server.name,
        "ip": state.config.server.public_ip,
        "port": state.config.wireguard.listen_port,
        "public_key": public_key,
        "dns": state.config.wireguard.dns,
        "subnet": state.config.wireguard.subnet,
    })))
}

async fn create_peer_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreatePeerRequest>,
) -> Result<Json<CreatePeerResponse>, ApiError> {
    authorize(&state, &headers)?;

    let peer = state.provisioner.create_peer(&req.identity, &req.label).await?;

    Ok(Json(CreatePeerResponse {
        success: true,
        peer_id: peer.peer_id,
        config: peer.config,
        assigned_address: peer.assigned_address.to_string(),
        public_key: peer.public_key,
        server_name: state.config.server.name.clone(),
        server_ip: state.config.server.public_ip.clone(),
    }))
}

async fn remove_peer_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RemovePeerRequest>,
) -> Result<Json<RemovePeerResponse>, ApiError> {
    authorize(&state, &headers)?;
    validate_public_key(&req.public_key)?;

    let outcome = state.provisioner.remove_peer(&req.public_key).await?;

    Ok(Json(RemovePeerResponse {
        success: true,
        message: if outcome.deactivated {
            "Peer removed".to_string()
        } else {
            "Peer already absent".to_string()
        },
    }))
}

async fn list_peers_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListPeersResponse>, ApiError> {
    authorize(&state, &headers)?;

    let peers = state.provisioner.list_peers().await?;

    Ok(Json(ListPeersResponse {
        success: true,
        peer_count: peers.len(),
        peers,
    }))
}

async fn get_config_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<GetConfigRequest>,
) -> Result<Json<GetConfigResponse>, ApiError> {
    authorize(&state, &headers)?;
    validate_public_key(&req.public_key)?;

    let config = state.provisioner.get_config(&req.public_key).await?;

    Ok(Json(GetConfigResponse {
        success: true,
        config,
    }))
}

async fn peer_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PeerStatusQuery>,
) -> Result<Json<PeerStatusResponse>, ApiError> {
    authorize(&state, &headers)?;
    validate_public_key(&query.public_key)?;

    let peer = state.provisioner.peer_status(&query.public_key).await?;

    Ok(Json(PeerStatusResponse {
        success: true,
        found: peer.is_some(),
        peer,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PeerStore;
    use crate::wg::mock::MockRuntime;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wgrelay_common::Database;

    const TEST_SECRET: &str = "test-secret";

    fn test_app() -> Router {
        let mut config = RelayConfig::default();
        config.server.name = "relay-test".to_string();
        config.server.public_ip = "203.0.113.7".to_string();
        config.auth.api_secret = TEST_SECRET.to_string();

        let db = Database::open_memory().unwrap();
        let store = PeerStore::new(db);
        store.init_schema().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provisioner =
            Arc::new(Provisioner::new(config.clone(), store, runtime).unwrap());

        router(Arc::new(AppState::new(provisioner, config)))
    }

    fn post_json(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let app = test_app();
        let response = app.oneshot(get_req("/api/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "online");
        assert_eq!(body["server"], "relay-test");
        assert_eq!(body["port"], 51820);
    }

    #[tokio::test]
    async fn test_server_info_needs_no_auth() {
        let app = test_app();
        let response = app.oneshot(get_req("/api/server-info", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["name"], "relay-test");
        assert_eq!(body["subnet"], "10.8.0.0/24");
        assert_eq!(body["public_key"], crate::wg::mock::MOCK_SERVER_KEY);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let app = test_app();
        let response = app
            .oneshot(post_json(
                "/api/create-peer",
                None,
                serde_json::json!({"identity": "u1", "label": "phone"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_wrong_token_is_unauthorized() {
        let app = test_app();
        let response = app
            .oneshot(get_req("/api/list-peers", Some("wrong-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_peer_flow() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/create-peer",
                Some(TEST_SECRET),
                serde_json::json!({"identity": "u1", "label": "phone"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["assigned_address"], "10.8.0.2");
        assert_eq!(body["server_name"], "relay-test");
        assert_eq!(body["server_ip"], "203.0.113.7");
        let public_key = body["public_key"].as_str().unwrap().to_string();
        let config = body["config"].as_str().unwrap().to_string();
        assert!(config.contains("Address = 10.8.0.2/32"));

        // Peer shows up in the runtime-backed listing
        let response = app
            .clone()
            .oneshot(get_req("/api/list-peers", Some(TEST_SECRET)))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["peer_count"], 1);
        assert_eq!(body["peers"][0]["public_key"], public_key.as_str());

        // Re-fetch returns the identical config text
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/get-config",
                Some(TEST_SECRET),
                serde_json::json!({"public_key": public_key}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["config"].as_str().unwrap(), config);

        // Remove, then a second remove is still success
        for expected in ["Peer removed", "Peer already absent"] {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/api/remove-peer",
                    Some(TEST_SECRET),
                    serde_json::json!({"public_key": public_key}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["success"], true);
            assert_eq!(body["message"], expected);
        }

        // Config for a removed peer is gone
        let response = app
            .oneshot(post_json(
                "/api/get-config",
                Some(TEST_SECRET),
                serde_json::json!({"public_key": public_key}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_identity_is_bad_request() {
        let app = test_app();
        let response = app
            .oneshot(post_json(
                "/api/create-peer",
                Some(TEST_SECRET),
                serde_json::json!({"identity": "", "label": "phone"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_malformed_public_key_is_bad_request() {
        let app = test_app();
        let response = app
            .oneshot(post_json(
                "/api/remove-peer",
                Some(TEST_SECRET),
                serde_json::json!({"public_key": "not a key"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_peer_status_endpoint() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/create-peer",
                Some(TEST_SECRET),
                serde_json::json!({"identity": "u1", "label": "phone"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let public_key = body["public_key"].as_str().unwrap().to_string();

        let uri = format!(
            "/api/peer-status?public_key={}",
            url_encode(&public_key)
        );
        let response = app
            .oneshot(get_req(&uri, Some(TEST_SECRET)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["found"], true);
        assert_eq!(body["peer"]["public_key"], public_key.as_str());
    }

    // Base64 keys can contain '+' and '/', which must be escaped in a query
    fn url_encode(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for b in s.bytes() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(b as char)
                }
                _ => out.push_str(&format!("%{:02X}", b)),
            }
        }
        out
    }
}
