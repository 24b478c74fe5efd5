use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use icrawl_core::{SyncOpStatus, SyncOperation};
use icrawl_storage::{PendingOp, SyncPublisher};
use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// FIFO operation log guarded by a mutex held only long enough to push or
/// drain, per spec.md §4.7 and §5. Bounded by `max_queue_size`; overflow
/// drops the oldest pending operation with a warning (producer is never
/// blocked).
pub struct ReplicationLog {
    queue: Mutex<VecDeque<SyncOperation>>,
    max_queue_size: usize,
    origin_node: String,
    seq: std::sync::atomic::AtomicU64,
    pub notify: Notify,
}

impl ReplicationLog {
    pub fn new(origin_node: impl Into<String>, max_queue_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            max_queue_size,
            origin_node: origin_node.into(),
            seq: std::sync::atomic::AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, kind: icrawl_core::SyncOpKind, table: String, payload: std::collections::BTreeMap<String, icrawl_core::ColumnValue>, target_nodes: Vec<String>) {
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let created_at = Utc::now();
        let op = SyncOperation {
            id: SyncOperation::derive_id(created_at, &self.origin_node, seq),
            kind,
            table_name: table,
            payload,
            origin_node: self.origin_node.clone(),
            target_nodes,
            status: SyncOpStatus::Pending,
            created_at,
        };
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.max_queue_size {
            let dropped = queue.pop_front();
            warn!(op_id = ?dropped.map(|o| o.id), "replication log overflow, dropping oldest pending operation");
        }
        queue.push_back(op);
        drop(queue);
        self.notify.notify_one();
    }

    /// Atomically swaps the entire buffer out for the drain loop to apply
    /// outside the lock.
    pub async fn drain(&self) -> Vec<SyncOperation> {
        let mut queue = self.queue.lock().await;
        std::mem::take(&mut *queue).into_iter().collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

/// A `SyncPublisher` that stamps each pending op with the current secondary
/// set at enqueue time, per spec.md §4.7 ("each enqueued Sync Operation
/// names the intended target node set"). Wraps a `ReplicationLog` plus the
/// registry it reads targets from.
pub struct TargetedPublisher {
    log: Arc<ReplicationLog>,
    registry: Arc<crate::registry::NodeRegistry>,
}

impl TargetedPublisher {
    pub fn new(log: Arc<ReplicationLog>, registry: Arc<crate::registry::NodeRegistry>) -> Self {
        Self { log, registry }
    }
}

#[async_trait]
impl SyncPublisher for TargetedPublisher {
    async fn publish(&self, op: PendingOp) {
        let targets: Vec<String> = self.registry.secondaries().into_iter().map(|n| n.name).collect();
        self.log.push(op.kind, op.table, op.payload, targets).await;
    }
}
