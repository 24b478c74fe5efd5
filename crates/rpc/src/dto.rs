use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use icrawl_core::{ColumnValue, NodeRole};
use serde::{Deserialize, Serialize};

/// `POST /api/role-change` request body, per spec.md §4.10.
#[derive(Debug, Deserialize)]
pub struct RoleChangeRequest {
    pub node_name: String,
    pub new_role: NodeRole,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

/// `POST /api/sync` request body. Field names follow spec.md §4.10's wire
/// shape (`operation_id`, `operation_type`, `data`) rather than the
/// in-process `SyncOperation` field names, since this is the RPC-fallback
/// delivery wire format, not the internal type.
#[derive(Debug, Deserialize, Serialize)]
pub struct SyncOperationRequest {
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation_type: icrawl_core::SyncOpKind,
    pub table_name: String,
    pub data: BTreeMap<String, ColumnValue>,
    pub source_node: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub role: NodeRole,
}

#[derive(Debug, Serialize)]
pub struct ClusterStatusResponse {
    pub nodes: Vec<icrawl_core::NodeDescriptor>,
    pub failover_state: String,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub queue_size: usize,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub auto_sync_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ReplicationLagEntry {
    pub node_name: String,
    pub lag_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct ReplicationLagResponse {
    pub nodes: Vec<ReplicationLagEntry>,
}

#[derive(Debug, Serialize)]
pub struct FailoverHistoryResponse {
    pub events: Vec<icrawl_core::FailoverEvent>,
}

/// `POST /crawl` request body for the control-plane stub, per SPEC_FULL.md's
/// "Control-plane HTTP API (peripheral)" section.
#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    pub seed_url: String,
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub max_images: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CrawlAcceptedResponse {
    pub session_id: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
