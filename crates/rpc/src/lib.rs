use std::sync::Arc;

use dashmap::DashMap;
use icrawl_cluster::RoleChangeNotifier;
use icrawl_core::NodeRole;
use tracing::warn;

pub mod client;
pub mod dto;
pub mod server;

pub use client::RpcClient;
pub use server::{router, AppState};

/// Implements `icrawl_cluster::RoleChangeNotifier` over the RPC client,
/// letting the Failover Controller announce a role change to every peer
/// without `crates/cluster` depending on `crates/rpc` (that dependency would
/// be circular, since this crate's `AppState` already depends on `Cluster`).
pub struct HttpRoleChangeNotifier {
    client: RpcClient,
    peer_addresses: Arc<DashMap<String, String>>,
}

impl HttpRoleChangeNotifier {
    pub fn new(peer_addresses: Arc<DashMap<String, String>>) -> Self {
        Self { client: RpcClient::new(), peer_addresses }
    }
}

#[async_trait::async_trait]
impl RoleChangeNotifier for HttpRoleChangeNotifier {
    async fn notify_role_change(&self, node: &str, role: NodeRole) {
        let Some(address) = self.peer_addresses.get(node).map(|a| a.clone()) else {
            warn!(node, "no control-plane address known for role-change notification");
            return;
        };
        if let Err(e) = self.client.notify_role_change(&address, node, role).await {
            warn!(node, error = %e, "role-change notification failed");
        }
    }
}
