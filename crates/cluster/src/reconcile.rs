use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::registry::NodeRegistry;

pub struct FullReconciliationConfig {
    pub interval: Duration,
    /// Number of newest rows compared per table, per spec.md §4.7 ("the set
    /// `{(id, updated_at)}` of the 5-10 newest rows").
    pub newest_n: i64,
    pub tables: Vec<String>,
}

/// Periodic deep-consistency sweep, run only on the primary, per spec.md
/// §4.7. Compares `(count, min(id), max(id))` and the newest-row set across
/// every secondary and repairs divergence by direction-selected bulk copy or
/// per-id content sync. Never deletes secondary rows absent from the
/// primary (spec.md §9 open question, resolved: preserve that behavior).
pub struct FullReconciliationWorker {
    registry: Arc<NodeRegistry>,
    pools: Arc<DashMap<String, PgPool>>,
    local_node_name: String,
    config: FullReconciliationConfig,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl FullReconciliationWorker {
    pub fn new(
        registry: Arc<NodeRegistry>,
        pools: Arc<DashMap<String, PgPool>>,
        local_node_name: String,
        config: FullReconciliationConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self { registry, pools, local_node_name, config, stop_tx, stop_rx }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!("full reconciliation worker stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let Some(primary) = self.registry.primary_name() else { return };
        if primary != self.local_node_name {
            // Only the primary drives reconciliation, per spec.md §4.7.
            return;
        }
        let Some(primary_pool) = self.pools.get(&primary).map(|p| p.clone()) else { return };

        for secondary in self.registry.secondaries() {
            let Some(secondary_pool) = self.pools.get(&secondary.name).map(|p| p.clone()) else { continue };
            for table in &self.config.tables {
                if let Err(e) =
                    reconcile_table(&primary_pool, &secondary_pool, table, self.config.newest_n).await
                {
                    warn!(node = %secondary.name, table, error = %e, "full reconciliation failed for table");
                }
            }
        }
    }
}

/// Reconciles one table between `primary_pool` and `secondary_pool`, per
/// spec.md §4.7's direction-selection rule. Exposed standalone so the
/// Failover Controller can call it for the best-effort forward sync of
/// §4.9 step 2 without going through the periodic loop.
pub async fn reconcile_table(
    primary_pool: &PgPool,
    secondary_pool: &PgPool,
    table: &str,
    newest_n: i64,
) -> anyhow::Result<()> {
    let primary_snapshot = icrawl_storage::table_snapshot(primary_pool, table, newest_n).await?;
    let secondary_snapshot = icrawl_storage::table_snapshot(secondary_pool, table, newest_n).await?;

    if primary_snapshot.count > secondary_snapshot.count {
        let deficit = primary_snapshot.count - secondary_snapshot.count;
        let min_id = secondary_snapshot.max_id.unwrap_or(0);
        let rows = icrawl_storage::fetch_rows_above(primary_pool, table, min_id, deficit).await?;
        debug!(table, rows = rows.len(), "copying primary-ahead rows to secondary");
        for row in &rows {
            icrawl_storage::upsert_row_json(secondary_pool, table, row).await?;
        }
    } else if secondary_snapshot.count > primary_snapshot.count {
        let deficit = secondary_snapshot.count - primary_snapshot.count;
        let min_id = primary_snapshot.max_id.unwrap_or(0);
        let rows = icrawl_storage::fetch_rows_above(secondary_pool, table, min_id, deficit).await?;
        debug!(table, rows = rows.len(), "copying secondary-ahead rows to primary");
        for row in &rows {
            icrawl_storage::upsert_row_json(primary_pool, table, row).await?;
        }
    } else if primary_snapshot.newest != secondary_snapshot.newest {
        let secondary_newest: HashMap<i64, _> = secondary_snapshot.newest.into_iter().collect();
        for (id, updated_at) in &primary_snapshot.newest {
            if secondary_newest.get(id) != Some(updated_at) {
                if let Some(row) = icrawl_storage::fetch_row_by_id(primary_pool, table, *id).await? {
                    icrawl_storage::upsert_row_json(secondary_pool, table, &row).await?;
                }
            }
        }
    }
    Ok(())
}

/// Reconciles every table in `tables` from `primary_pool` into
/// `target_pool`. Used by the Failover Controller's forward-sync step.
pub async fn reconcile_all(
    primary_pool: &PgPool,
    target_pool: &PgPool,
    tables: &[String],
    newest_n: i64,
) -> anyhow::Result<()> {
    for table in tables {
        reconcile_table(primary_pool, target_pool, table, newest_n).await?;
    }
    Ok(())
}
