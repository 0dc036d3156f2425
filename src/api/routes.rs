//! API Routes
//!
//! HTTP endpoints for health checks, status, metrics and block submission

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::Metrics;
use crate::relay::health::StatusSnapshot;
use crate::relay::RelayHandle;
use crate::types::BlockHash;

/// Shared API state
pub struct ApiState {
    /// Relays by chain name
    pub relays: BTreeMap<String, RelayHandle>,
    pub metrics: Arc<Metrics>,
}

/// POST /chains/:chain/blocks body
#[derive(Debug, Deserialize)]
struct SubmitBlockRequest {
    /// Serialized block, hex
    payload_hex: String,

    /// Block hash for logs and stats, hex
    #[serde(default)]
    hash: Option<String>,
}

/// Build the API router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health_all))
        .route("/status", get(status_all))
        .route("/chains/:chain/health", get(chain_health))
        .route("/chains/:chain/status", get(chain_status))

        // Block submission
        .route("/chains/:chain/blocks", post(submit_block))

        // Metrics
        .route("/metrics", get(get_metrics_prometheus))

        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_api_server(port: u16, state: Arc<ApiState>) -> anyhow::Result<()> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("📊 HTTP API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn unknown_chain(chain: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("unknown chain: {}", chain))
}

fn parse_block_hash(hex_hash: &str) -> Option<BlockHash> {
    let bytes = hex::decode(hex_hash).ok()?;
    bytes.try_into().ok()
}

/// Status of every relay that still answers
async fn collect_status(state: &ApiState) -> Vec<StatusSnapshot> {
    let mut snapshots = Vec::with_capacity(state.relays.len());
    for relay in state.relays.values() {
        match relay.status().await {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => warn!("[{}] Status unavailable: {}", relay.chain(), e),
        }
    }
    snapshots
}

/// GET /health - Health of every chain. Always 200; the verdict is advisory.
async fn health_all(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.metrics.inc_status_requests();

    let mut chains = Vec::with_capacity(state.relays.len());
    for relay in state.relays.values() {
        if let Ok(health) = relay.health().await {
            chains.push(health);
        }
    }
    let healthy = chains.iter().all(|h| h.healthy);

    Json(serde_json::json!({
        "healthy": healthy,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "chains": chains,
    }))
}

/// GET /status - Full status of every chain
async fn status_all(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.metrics.inc_status_requests();
    Json(collect_status(&state).await)
}

/// GET /chains/:chain/health
async fn chain_health(
    State(state): State<Arc<ApiState>>,
    Path(chain): Path<String>,
) -> Response {
    state.metrics.inc_status_requests();

    let Some(relay) = state.relays.get(&chain) else {
        return unknown_chain(&chain);
    };
    match relay.health().await {
        Ok(health) => Json(health).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// GET /chains/:chain/status
async fn chain_status(
    State(state): State<Arc<ApiState>>,
    Path(chain): Path<String>,
) -> Response {
    state.metrics.inc_status_requests();

    let Some(relay) = state.relays.get(&chain) else {
        return unknown_chain(&chain);
    };
    match relay.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// POST /chains/:chain/blocks - Broadcast a found block
async fn submit_block(
    State(state): State<Arc<ApiState>>,
    Path(chain): Path<String>,
    Json(request): Json<SubmitBlockRequest>,
) -> Response {
    let Some(relay) = state.relays.get(&chain) else {
        return unknown_chain(&chain);
    };

    let payload = match hex::decode(request.payload_hex.trim()) {
        Ok(payload) if !payload.is_empty() => payload,
        Ok(_) => {
            state.metrics.inc_blocks_rejected();
            return error_response(StatusCode::BAD_REQUEST, "empty payload");
        }
        Err(e) => {
            state.metrics.inc_blocks_rejected();
            return error_response(StatusCode::BAD_REQUEST, format!("payload_hex: {}", e));
        }
    };

    let hash = match request.hash.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(hex_hash) => match parse_block_hash(hex_hash) {
            Some(hash) => Some(hash),
            None => {
                state.metrics.inc_blocks_rejected();
                return error_response(StatusCode::BAD_REQUEST, "hash must be 32 bytes of hex");
            }
        },
    };

    state.metrics.inc_blocks_submitted();
    match relay.broadcast_block(payload, hash).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let snapshots = collect_status(&state).await;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.to_prometheus(&snapshots),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelaySettings;
    use crate::registry::PeerStore;
    use crate::relay::{RelayIo, RelayParams};
    use crate::transport::mock::{local_peer, MockLocalNode, MockNetwork};
    use crate::types::PeerEndpoint;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn state(dir: &std::path::Path) -> Arc<ApiState> {
        let io = RelayIo {
            transport: Arc::new(MockNetwork::new()),
            local_node: Arc::new(MockLocalNode::new(vec![
                local_peer("10.0.0.1:9333", false, Some(25)),
                local_peer("10.0.0.2:9333", true, Some(60)),
            ])),
            submitters: vec![],
        };
        let params = RelayParams {
            chain: "ltc".to_string(),
            local_endpoint: PeerEndpoint::new("127.0.0.1", 9333),
            default_port: 9333,
            settings: RelaySettings::default(),
        };
        let store = PeerStore::new(dir.join("broadcast_peers_ltc.json"), [9333]);
        let relay = RelayHandle::spawn(params, store, io).await;

        Arc::new(ApiState {
            relays: BTreeMap::from([("ltc".to_string(), relay)]),
            metrics: Arc::new(Metrics::new()),
        })
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()).await);

        let response = app
            .oneshot(Request::get("/chains/ltc/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["chain"], "ltc");
        assert_eq!(body["protected_connection_present"], true);
        assert_eq!(body["bootstrapped"], false);
    }

    #[tokio::test]
    async fn test_unknown_chain_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()).await);

        let response = app
            .oneshot(Request::get("/chains/doge/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_block_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path()).await;
        let app = router(state.clone());

        let body = serde_json::json!({
            "payload_hex": "00112233",
            "hash": "ab".repeat(32),
        });
        let response = app
            .oneshot(
                Request::post("/chains/ltc/blocks")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Bootstrapped on demand: local node plus two peers
        let report = json_body(response).await;
        assert_eq!(report["peer_successes"], 3);
        assert_eq!(report["local_node_accepted"], true);
        assert_eq!(report["block_hash"], "ab".repeat(32));
        assert_eq!(state.metrics.blocks_submitted.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_submit_block_rejects_bad_hex() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()).await);

        let response = app
            .oneshot(
                Request::post("/chains/ltc/blocks")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"payload_hex":"zz"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_route_has_chain_labels() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()).await);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("sharepool_relay_protected_connected{chain=\"ltc\"} 1"));
        assert!(text.contains("sharepool_relay_connections{chain=\"ltc\"} 1"));
    }
}
