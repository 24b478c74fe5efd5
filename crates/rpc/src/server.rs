use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use icrawl_cluster::{Cluster, FailoverState};
use icrawl_core::{NodeRole, SyncOpStatus, SyncOperation};
use icrawl_storage::Storage;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::dto::*;

/// Shared state for both the Inter-Node RPC router and the control-plane
/// stub, per SPEC_FULL.md ("reusing its `AppState`"). Constructed once in
/// `main` alongside the `Cluster` handle and injected as `axum::extract::State`
/// (REDESIGN FLAGS: no global singleton).
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub local_storage: Storage,
}

struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// Builds the full router: the nine Inter-Node RPC routes of spec.md §4.10
/// plus the thin control-plane stub of SPEC_FULL.md's peripheral section.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/role-change", post(role_change))
        .route("/api/sync", post(receive_sync))
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/sync-status", get(sync_status))
        .route("/api/sync/enable", post(sync_enable))
        .route("/api/sync/disable", post(sync_disable))
        .route("/api/failover/:target", post(manual_failover))
        .route("/api/force-sync", post(force_sync))
        .route("/api/replication-lag", get(replication_lag))
        .route("/crawl", post(submit_crawl))
        .route("/crawl/:id/status", get(crawl_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn role_change(
    State(state): State<AppState>,
    Json(req): Json<RoleChangeRequest>,
) -> Json<StatusResponse> {
    info!(node = %req.node_name, role = ?req.new_role, "peer notified role change");
    state.cluster.registry.set_role(&req.node_name, req.new_role);
    Json(StatusResponse { status: "ok".into() })
}

async fn receive_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncOperationRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let op = SyncOperation {
        id: req.operation_id,
        kind: req.operation_type,
        table_name: req.table_name,
        payload: req.data,
        origin_node: req.source_node,
        target_nodes: vec![state.cluster.local_node_name.clone()],
        status: SyncOpStatus::Pending,
        created_at: req.timestamp,
    };
    icrawl_storage::apply_sync_operation(state.local_storage.pool(), &op).await?;
    Ok(Json(StatusResponse { status: "applied".into() }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let role = state
        .cluster
        .registry
        .get(&state.cluster.local_node_name)
        .map(|n| n.role)
        .unwrap_or(NodeRole::Standby);
    Json(HealthResponse {
        status: "ok".into(),
        timestamp: chrono::Utc::now(),
        node_name: state.cluster.local_node_name.clone(),
        role,
    })
}

async fn status(State(state): State<AppState>) -> Json<ClusterStatusResponse> {
    let failover_state = match state.cluster.failover.state().await {
        FailoverState::Normal => "normal",
        FailoverState::Detecting => "detecting",
        FailoverState::Switching => "switching",
    };
    Json(ClusterStatusResponse { nodes: state.cluster.registry.snapshot(), failover_state: failover_state.into() })
}

async fn sync_status(State(state): State<AppState>) -> Json<SyncStatusResponse> {
    Json(SyncStatusResponse {
        queue_size: state.cluster.replication_log.len().await,
        last_full_sync: None,
        auto_sync_enabled: state.cluster.auto_sync_enabled.load(std::sync::atomic::Ordering::SeqCst),
    })
}

async fn sync_enable(State(state): State<AppState>) -> Json<StatusResponse> {
    state.cluster.auto_sync_enabled.store(true, std::sync::atomic::Ordering::SeqCst);
    info!("auto-sync enabled via RPC");
    Json(StatusResponse { status: "enabled".into() })
}

async fn sync_disable(State(state): State<AppState>) -> Json<StatusResponse> {
    state.cluster.auto_sync_enabled.store(false, std::sync::atomic::Ordering::SeqCst);
    info!("auto-sync disabled via RPC");
    Json(StatusResponse { status: "disabled".into() })
}

async fn manual_failover(State(state): State<AppState>, Path(target): Path<String>) -> Json<StatusResponse> {
    let Some(primary) = state.cluster.registry.primary_name() else {
        return Json(StatusResponse { status: "no primary to fail over from".into() });
    };
    warn!(target, primary, "manual failover requested via RPC");
    state.cluster.failover.on_node_unreachable(&primary, "manual failover requested").await;
    Json(StatusResponse { status: "failover attempted".into() })
}

async fn force_sync(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let Some(primary_pool) = state.cluster.pools.get(&state.cluster.local_node_name).map(|p| p.clone()) else {
        return Ok(Json(StatusResponse { status: "local node has no registered pool".into() }));
    };
    for secondary in state.cluster.registry.secondaries() {
        let Some(secondary_pool) = state.cluster.pools.get(&secondary.name).map(|p| p.clone()) else { continue };
        for table in icrawl_storage::schema::REPLICATED_TABLES {
            icrawl_cluster::reconcile_table(&primary_pool, &secondary_pool, table, 10).await?;
        }
    }
    Ok(Json(StatusResponse { status: "reconciliation triggered".into() }))
}

async fn replication_lag(State(state): State<AppState>) -> Json<ReplicationLagResponse> {
    let nodes = state
        .cluster
        .registry
        .secondaries()
        .into_iter()
        .map(|n| ReplicationLagEntry { node_name: n.name, lag_secs: n.replication_lag_secs })
        .collect();
    Json(ReplicationLagResponse { nodes })
}

/// `POST /crawl` — thin pass-through per SPEC_FULL.md: creates a crawl
/// session row and returns `202`, or `409` if one is already running.
/// Business logic (actually running the crawl) lives in the crawl engine,
/// not here.
async fn submit_crawl(
    State(state): State<AppState>,
    Json(req): Json<CrawlRequest>,
) -> Result<Response, ApiError> {
    let repo = state.local_storage.repository();
    let max_depth = req.max_depth.unwrap_or(3) as i32;
    let session_id = repo.create_crawl_session(&req.seed_url, max_depth).await?;
    Ok((StatusCode::ACCEPTED, Json(CrawlAcceptedResponse { session_id, status: "queued".into() })).into_response())
}

async fn crawl_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let repo = state.local_storage.repository();
    match repo.get_crawl_session(id).await? {
        Some(session) => Ok(Json(session).into_response()),
        None => Ok((StatusCode::NOT_FOUND, Json(ErrorResponse { error: "crawl session not found".into() })).into_response()),
    }
}
