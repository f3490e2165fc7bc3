/**
 * API REST - Exposition du coordinateur de partage de charge
 *
 * ROUTES :
 * - GET    /loadsharing/peers          vue fusionnée (découverts + groupe)
 * - POST   /loadsharing/peers          {"host": "..."} rejoindre le groupe
 * - DELETE /loadsharing/peers/{host}   quitter le groupe
 * - POST   /loadsharing/discover       découverte immédiate
 * - GET    /loadsharing/status         dernier GroupState calculé
 * - GET    /health, /system/health
 *
 * Les handlers ne lisent que l'état publié ou passent par le handle :
 * aucun ne bloque sur la tâche coordinateur. Erreurs : {"msg": "..."}.
 *
 * SÉCURITÉ :
 * Si LOADSHARE_API_KEY est défini, le header x-api-key est exigé partout
 * sauf sur /health.
 */

use crate::coordinator::CoordinatorHandle;
use crate::group::GroupError;
use crate::health::CoordinatorHealth;
use crate::models::GroupState;
use crate::registry::PeerInfo;
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(coordinator: CoordinatorHandle) -> Self {
        let api_key = std::env::var("LOADSHARE_API_KEY").ok().filter(|k| !k.is_empty());
        Self { coordinator, api_key }
    }
}

fn msg(code: StatusCode, text: &str) -> Response {
    (code, Json(json!({ "msg": text }))).into_response()
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/loadsharing/peers", get(get_peers).post(post_peer).delete(delete_without_host))
        .route("/loadsharing/peers/{host}", delete(delete_peer))
        .route("/loadsharing/discover", post(discover))
        .route("/loadsharing/status", get(get_status))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
struct PeersQuery {
    #[serde(default = "yes")]
    discovered: bool,
    #[serde(default = "yes")]
    group: bool,
}

fn yes() -> bool {
    true
}

async fn get_peers(State(app): State<AppState>, Query(q): Query<PeersQuery>) -> Json<Vec<PeerInfo>> {
    let peers = app.coordinator.peers(q.discovered, q.group);
    debug!(count = peers.len(), "GET /loadsharing/peers");
    Json(peers)
}

async fn post_peer(State(app): State<AppState>, body: Bytes) -> Response {
    let doc: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(doc) => doc,
        Err(e) => {
            debug!(error = %e, "invalid join body");
            return msg(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };
    let Some(host) = doc.get("host").and_then(|h| h.as_str()) else {
        return msg(StatusCode::BAD_REQUEST, "Missing required 'host' parameter");
    };
    if host.trim().is_empty() {
        return msg(StatusCode::BAD_REQUEST, "Host cannot be empty");
    }

    match app.coordinator.join(host) {
        Ok(host) => {
            info!(host = %host, total = app.coordinator.group_members().len(), "peer added via API");
            msg(StatusCode::OK, "done")
        }
        Err(GroupError::InvalidHost(_)) => {
            msg(StatusCode::BAD_REQUEST, "Invalid host format - must contain domain or IP")
        }
        Err(GroupError::AlreadyMember(_)) => msg(StatusCode::BAD_REQUEST, "Peer already in group"),
        Err(e) => {
            warn!(error = %e, "join failed");
            msg(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

async fn delete_without_host() -> Response {
    msg(StatusCode::NOT_IMPLEMENTED, "Not implemented")
}

async fn delete_peer(State(app): State<AppState>, Path(host): Path<String>) -> Response {
    match app.coordinator.leave(&host) {
        Ok(()) => {
            info!(host = %host, remaining = app.coordinator.group_members().len(), "peer removed via API");
            msg(StatusCode::OK, "done")
        }
        Err(GroupError::NotFound(_)) => msg(StatusCode::NOT_FOUND, "Peer not found"),
        Err(e) => {
            warn!(error = %e, "leave failed");
            msg(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

async fn discover(State(app): State<AppState>) -> Response {
    app.coordinator.trigger_discovery();
    debug!("manual discovery requested");
    msg(StatusCode::OK, "done")
}

async fn get_status(State(app): State<AppState>) -> Json<GroupState> {
    Json(app.coordinator.group_state())
}

async fn get_system_health(State(app): State<AppState>) -> Json<CoordinatorHealth> {
    Json(app.coordinator.health())
}
