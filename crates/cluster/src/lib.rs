use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use icrawl_core::config::{ClusterConfig, FailoverConfig, SyncConfig};
use icrawl_storage::AutoSyncFlag;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

pub mod failover;
pub mod health;
pub mod reconcile;
pub mod registry;
pub mod replication_log;
pub mod sync;

pub use failover::{FailoverController, FailoverControllerConfig, FailoverState, RoleChangeNotifier};
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use reconcile::{reconcile_all, reconcile_table, FullReconciliationConfig, FullReconciliationWorker};
pub use registry::NodeRegistry;
pub use replication_log::{ReplicationLog, TargetedPublisher};
pub use sync::{IncrementalSyncConfig, IncrementalSyncWorker};

/// Dependency-injected handle aggregating every HA-layer component, built
/// once in `main` and shared between the Crawl Engine and the RPC server
/// (REDESIGN FLAGS: "Global singleton cluster state" -> injected handle).
pub struct Cluster {
    pub registry: Arc<NodeRegistry>,
    pub pools: Arc<DashMap<String, PgPool>>,
    pub replication_log: Arc<ReplicationLog>,
    pub health_monitor: Arc<HealthMonitor>,
    pub incremental_sync: Arc<IncrementalSyncWorker>,
    pub full_reconciliation: Arc<FullReconciliationWorker>,
    pub failover: Arc<FailoverController>,
    pub local_node_name: String,
    /// Runtime toggle for `sync.auto_sync_enabled`, shared with every
    /// `AutoSyncSession` the crawl engine opens and mutated by the
    /// `/api/sync/{enable,disable}` RPC endpoints.
    pub auto_sync_enabled: AutoSyncFlag,
}

impl Cluster {
    /// Connects a pool to every configured node's database and wires up
    /// every background component, but does not start any of them.
    pub async fn connect(
        cluster_config: &ClusterConfig,
        sync_config: &SyncConfig,
        failover_config: &FailoverConfig,
        notifier: Option<Arc<dyn RoleChangeNotifier>>,
    ) -> anyhow::Result<Self> {
        let nodes: Vec<icrawl_core::NodeDescriptor> = cluster_config
            .nodes
            .iter()
            .map(|n| icrawl_core::NodeDescriptor {
                name: n.name.clone(),
                role: n.role,
                priority: n.priority,
                address: n.address.clone(),
                database_url: n.database_url.clone(),
                health: icrawl_core::NodeHealth::Unknown,
                consecutive_failures: 0,
                replication_lag_secs: 0.0,
                last_probe: None,
                last_error: None,
            })
            .collect();
        let registry = Arc::new(NodeRegistry::new(nodes));

        let pools = Arc::new(DashMap::new());
        for node in &cluster_config.nodes {
            match PgPoolOptions::new().max_connections(5).connect(&node.database_url).await {
                Ok(pool) => {
                    pools.insert(node.name.clone(), pool);
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "could not connect to node at startup, will retry via health monitor");
                }
            }
        }

        let replication_log = Arc::new(ReplicationLog::new(&cluster_config.local_node_name, sync_config.max_queue_size));

        let failover = Arc::new(FailoverController::new(
            registry.clone(),
            pools.clone(),
            FailoverControllerConfig {
                failure_threshold: failover_config.failure_threshold,
                failover_timeout: Duration::from_secs(failover_config.failover_timeout_secs),
                wait_for_catchup: failover_config.wait_for_catchup,
                sync_tables: sync_config.sync_tables.clone(),
            },
            notifier,
        ));

        let auto_failover_enabled = failover_config.enable_auto_failover;
        let failover_for_hook = failover.clone();
        let health_monitor = Arc::new(
            HealthMonitor::new(
                registry.clone(),
                pools.clone(),
                HealthMonitorConfig {
                    interval: Duration::from_secs(failover_config.health_check_interval_secs),
                    failure_threshold: failover_config.failure_threshold,
                    detection_threshold: failover_config.detection_threshold,
                    replication_lag_warning_secs: sync_config.incremental_sync_interval_secs as f64 * 5.0,
                },
                None,
            )
            .with_offline_hook(Arc::new(move |node: String, error: String| {
                if !auto_failover_enabled {
                    return;
                }
                let failover = failover_for_hook.clone();
                tokio::spawn(async move { failover.on_node_unreachable(&node, &error).await });
            })),
        );

        let incremental_sync = Arc::new(IncrementalSyncWorker::new(
            replication_log.clone(),
            pools.clone(),
            IncrementalSyncConfig { interval: Duration::from_secs(sync_config.incremental_sync_interval_secs) },
        ));

        let full_reconciliation = Arc::new(FullReconciliationWorker::new(
            registry.clone(),
            pools.clone(),
            cluster_config.local_node_name.clone(),
            FullReconciliationConfig {
                interval: Duration::from_secs(sync_config.full_sync_interval_secs),
                newest_n: 10,
                tables: sync_config.sync_tables.clone(),
            },
        ));

        Ok(Self {
            registry,
            pools,
            replication_log,
            health_monitor,
            incremental_sync,
            full_reconciliation,
            failover,
            local_node_name: cluster_config.local_node_name.clone(),
            auto_sync_enabled: icrawl_storage::new_auto_sync_flag(sync_config.auto_sync_enabled),
        })
    }

    pub fn publisher(&self) -> Arc<TargetedPublisher> {
        Arc::new(TargetedPublisher::new(self.replication_log.clone(), self.registry.clone()))
    }

    /// Spawns the Health Monitor, Incremental Sync Worker, and Full
    /// Reconciliation Worker. Returns their join handles so callers can wait
    /// on clean shutdown (`Start(ctx)/Stop(ctx)` per REDESIGN FLAGS).
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        info!(node = %self.local_node_name, "starting cluster background workers");
        vec![
            tokio::spawn(self.health_monitor.clone().run()),
            tokio::spawn(self.incremental_sync.clone().run()),
            tokio::spawn(self.full_reconciliation.clone().run()),
        ]
    }

    pub fn stop(&self) {
        self.health_monitor.stop();
        self.incremental_sync.stop();
        self.full_reconciliation.stop();
    }
}
