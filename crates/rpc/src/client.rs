use icrawl_core::{NodeRole, SyncOperation};

use crate::dto::{RoleChangeRequest, SyncOperationRequest};

/// Thin `reqwest` client for the two outbound paths that go over HTTP
/// instead of a direct database connection: role-change notification
/// (always RPC, there is no DB-level equivalent) and the non-default
/// `/api/sync` fallback delivery mode (spec.md §4.10, §9 open question —
/// direct-DB delivery is preferred and is what the sync workers use).
pub struct RpcClient {
    http: reqwest::Client,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    pub async fn notify_role_change(&self, peer_address: &str, node_name: &str, new_role: NodeRole) -> anyhow::Result<()> {
        let body = RoleChangeRequest { node_name: node_name.to_string(), new_role, timestamp: chrono::Utc::now() };
        self.http
            .post(format!("http://{peer_address}/api/role-change"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Delivers one Sync Operation to a peer over HTTP. Not used by the
    /// Incremental Sync Worker, which prefers direct-DB delivery; kept for
    /// the fallback mode and for operators who run nodes without mutual
    /// database network access.
    pub async fn deliver_sync_operation(&self, peer_address: &str, op: &SyncOperation) -> anyhow::Result<()> {
        let body = SyncOperationRequest {
            operation_id: op.id.clone(),
            timestamp: op.created_at,
            operation_type: op.kind,
            table_name: op.table_name.clone(),
            data: op.payload.clone(),
            source_node: op.origin_node.clone(),
        };
        self.http
            .post(format!("http://{peer_address}/api/sync"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn force_sync(&self, peer_address: &str) -> anyhow::Result<()> {
        self.http.post(format!("http://{peer_address}/api/force-sync")).send().await?.error_for_status()?;
        Ok(())
    }
}
