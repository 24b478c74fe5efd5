use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use icrawl_core::{ClusterError, FailoverEvent, FailoverOutcome, NodeRole};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::reconcile::reconcile_all;
use crate::registry::NodeRegistry;

const MAX_HISTORY: usize = 100;

/// Failover state machine, per spec.md §4.9: Normal -> Detecting ->
/// Switching -> {Completed, Failed} -> Normal. Exactly one switch runs at a
/// time, enforced by `switching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Normal,
    Detecting,
    Switching,
}

/// Invoked after a role change takes effect in the registry, so the RPC
/// layer can notify peers without `cluster` depending on `rpc`.
#[async_trait::async_trait]
pub trait RoleChangeNotifier: Send + Sync {
    async fn notify_role_change(&self, node: &str, role: NodeRole);
}

pub struct FailoverControllerConfig {
    pub failure_threshold: u32,
    pub failover_timeout: Duration,
    pub wait_for_catchup: bool,
    pub sync_tables: Vec<String>,
}

/// Orchestrates promotion of a healthy secondary/standby to primary when the
/// current primary is declared unreachable. Grounded on spec.md §4.9; no
/// teacher analogue exists, built fresh in the ambient idiom (watch-channel
/// lifecycle, `Arc<DashMap>` pools, `thiserror`-based error propagation).
pub struct FailoverController {
    registry: Arc<NodeRegistry>,
    pools: Arc<DashMap<String, PgPool>>,
    config: FailoverControllerConfig,
    state: Mutex<FailoverState>,
    switching: AtomicBool,
    history: Mutex<VecDeque<FailoverEvent>>,
    notifier: Option<Arc<dyn RoleChangeNotifier>>,
}

impl FailoverController {
    pub fn new(
        registry: Arc<NodeRegistry>,
        pools: Arc<DashMap<String, PgPool>>,
        config: FailoverControllerConfig,
        notifier: Option<Arc<dyn RoleChangeNotifier>>,
    ) -> Self {
        Self {
            registry,
            pools,
            config,
            state: Mutex::new(FailoverState::Normal),
            switching: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            notifier,
        }
    }

    pub async fn state(&self) -> FailoverState {
        *self.state.lock().await
    }

    pub async fn history(&self) -> Vec<FailoverEvent> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Called by the Health Monitor when a node's consecutive probe
    /// failures reach `failure_threshold`. No-op for anything but the
    /// current primary, and no-op if a switch is already underway.
    pub async fn on_node_unreachable(&self, node: &str, reason: &str) {
        let Some(primary) = self.registry.primary_name() else { return };
        if primary != node {
            return;
        }
        if self.switching.swap(true, Ordering::SeqCst) {
            warn!(node, "failover already in progress, ignoring repeat trigger");
            return;
        }
        *self.state.lock().await = FailoverState::Detecting;
        let outcome = self.run_switch(&primary, reason).await;
        self.switching.store(false, Ordering::SeqCst);
        *self.state.lock().await = FailoverState::Normal;
        if let Err(e) = outcome {
            error!(node, error = %e, "failover did not complete");
        }
    }

    async fn run_switch(&self, failed_primary: &str, reason: &str) -> anyhow::Result<()> {
        *self.state.lock().await = FailoverState::Switching;
        let start = Instant::now();

        let candidates = self.registry.failover_candidates();
        let Some(target) = candidates.into_iter().next() else {
            self.record_event(failed_primary, "<none>", reason, FailoverOutcome::Failed, start, Some("no failover candidate available".into())).await;
            return Err(ClusterError::NoFailoverCandidate.into());
        };

        let result = tokio::time::timeout(self.config.failover_timeout, self.switch_to(failed_primary, &target.name)).await;
        match result {
            Ok(Ok(())) => {
                self.record_event(failed_primary, &target.name, reason, FailoverOutcome::Completed, start, None).await;
                info!(from = failed_primary, to = %target.name, "failover completed");
                Ok(())
            }
            Ok(Err(e)) => {
                self.record_event(failed_primary, &target.name, reason, FailoverOutcome::Failed, start, Some(e.to_string())).await;
                Err(e)
            }
            Err(_) => {
                let err = ClusterError::FailoverInProgress;
                self.record_event(failed_primary, &target.name, reason, FailoverOutcome::Failed, start, Some("timed out".into())).await;
                Err(err.into())
            }
        }
    }

    async fn switch_to(&self, failed_primary: &str, target: &str) -> anyhow::Result<()> {
        let target_pool = self
            .pools
            .get(target)
            .map(|p| p.clone())
            .ok_or_else(|| ClusterError::Schema { node: target.to_string(), reason: "no pool registered".into() })?;
        target_pool.acquire().await.map_err(ClusterError::Database)?;

        for table in &self.config.sync_tables {
            icrawl_storage::ensure_table(&target_pool, table).await?;
        }

        if self.config.wait_for_catchup {
            if let Some(old_primary_pool) = self.pools.get(failed_primary).map(|p| p.clone()) {
                if let Err(e) = reconcile_all(&old_primary_pool, &target_pool, &self.config.sync_tables, 10).await {
                    warn!(target, error = %e, "best-effort forward sync before promotion failed, continuing");
                }
            }
        }

        self.registry.set_role(target, NodeRole::Primary);
        self.registry.set_role(failed_primary, NodeRole::Secondary);
        self.registry.clear_failure_counters();

        if let Some(notifier) = &self.notifier {
            notifier.notify_role_change(target, NodeRole::Primary).await;
            notifier.notify_role_change(failed_primary, NodeRole::Secondary).await;
        }
        Ok(())
    }

    async fn record_event(
        &self,
        source: &str,
        target: &str,
        reason: &str,
        outcome: FailoverOutcome,
        start: Instant,
        error: Option<String>,
    ) {
        let event = FailoverEvent {
            timestamp: Utc::now(),
            source_node: source.to_string(),
            target_node: target.to_string(),
            reason: reason.to_string(),
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
            error,
        };
        let mut history = self.history.lock().await;
        if history.len() >= MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icrawl_core::NodeDescriptor;
    use icrawl_core::NodeHealth;

    fn node(name: &str, role: NodeRole, priority: i32, health: NodeHealth) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            role,
            priority,
            address: format!("{name}:5432"),
            database_url: format!("postgres://{name}"),
            health,
            consecutive_failures: 0,
            replication_lag_secs: 0.0,
            last_probe: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn no_candidate_leaves_state_normal_and_records_failure() {
        let registry = Arc::new(NodeRegistry::new([node("p", NodeRole::Primary, 1, NodeHealth::Healthy)]));
        let pools = Arc::new(DashMap::new());
        let controller = FailoverController::new(
            registry,
            pools,
            FailoverControllerConfig {
                failure_threshold: 3,
                failover_timeout: Duration::from_secs(1),
                wait_for_catchup: false,
                sync_tables: vec!["images".into()],
            },
            None,
        );
        controller.on_node_unreachable("p", "probe failed").await;
        assert_eq!(controller.state().await, FailoverState::Normal);
        let history = controller.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, FailoverOutcome::Failed);
    }

    #[tokio::test]
    async fn ignores_trigger_for_non_primary_node() {
        let registry = Arc::new(NodeRegistry::new([
            node("p", NodeRole::Primary, 1, NodeHealth::Healthy),
            node("s1", NodeRole::Secondary, 2, NodeHealth::Healthy),
        ]));
        let pools = Arc::new(DashMap::new());
        let controller = FailoverController::new(
            registry,
            pools,
            FailoverControllerConfig {
                failure_threshold: 3,
                failover_timeout: Duration::from_secs(1),
                wait_for_catchup: false,
                sync_tables: vec!["images".into()],
            },
            None,
        );
        controller.on_node_unreachable("s1", "probe failed").await;
        assert!(controller.history().await.is_empty());
    }
}
