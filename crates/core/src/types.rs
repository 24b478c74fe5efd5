use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

/// Per-request knobs passed from the caller down to the Session Transport.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_body_size: usize,
    pub follow_redirects: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_size: 20 * 1024 * 1024,
            follow_redirects: true,
        }
    }
}

/// The raw result of a Session Transport request. See spec.md §4.2/§4.4.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub response_time_ms: u64,
}

/// A task in the crawl engine's page queue.
#[derive(Debug, Clone)]
pub struct PageTask {
    pub url: String,
    pub depth: u32,
    pub source_url: Option<String>,
    pub priority: f64,
    pub retry_count: u32,
    pub seq: u64,
}

/// A task in the crawl engine's download queue.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub source_url: Option<String>,
    pub filename: Option<String>,
    pub priority: f64,
    pub retry_count: u32,
    pub seq: u64,
}

/// Numeric priority, ascending, with a monotonic sequence number as
/// tiebreaker so heterogeneous task records never need comparing amongst
/// themselves beyond (priority, seq).
#[derive(Debug, Clone, Copy)]
pub struct QueuePriority {
    pub priority: f64,
    pub seq: u64,
}

impl PartialEq for QueuePriority {
    fn eq(&self, other: &Self) -> bool {
        self.priority.to_bits() == other.priority.to_bits() && self.seq == other.seq
    }
}
impl Eq for QueuePriority {}

impl PartialOrd for QueuePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ascending priority: smaller numeric priority sorts "greater" so a
        // max-heap `PriorityQueue` dequeues it first, matching spec.md's
        // "ordering is by numeric priority ascending".
        other
            .priority
            .partial_cmp(&self.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Image Record — see spec.md §3 "Image Record" and §6 `images` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub url: String,
    pub source_url: Option<String>,
    pub filename: String,
    pub file_extension: String,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub md5_hash: Option<String>,
    pub sha256_hash: Option<String>,
    pub category_id: Option<i64>,
    pub local_path: Option<String>,
    pub is_downloaded: bool,
    pub download_attempts: i32,
    pub last_download_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
}

/// Category — see spec.md §3 "Category" and §6 `categories` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub parent_id: Option<i64>,
    pub image_count: i64,
    pub total_size: i64,
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlSessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CrawlSessionStatus {
    /// Monotonic transition check per spec.md §3:
    /// pending -> running -> {completed | failed}.
    pub fn can_transition_to(self, next: Self) -> bool {
        use CrawlSessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Crawl Session — see spec.md §3 and §6 `crawl_sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSession {
    pub id: i64,
    pub target_url: String,
    pub status: CrawlSessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_pages: i64,
    pub processed_pages: i64,
    pub total_images_found: i64,
    pub images_downloaded: i64,
    pub images_failed: i64,
    pub summary_log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Secondary,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Warning,
    Offline,
    Unknown,
}

/// Process-local view of a cluster peer. See spec.md §3 "Node Descriptor".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub role: NodeRole,
    pub priority: i32,
    pub address: String,
    pub database_url: String,
    pub health: NodeHealth,
    pub consecutive_failures: u32,
    pub replication_lag_secs: f64,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl NodeDescriptor {
    pub fn is_failover_candidate(&self) -> bool {
        matches!(self.role, NodeRole::Secondary | NodeRole::Standby) && self.health == NodeHealth::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOpKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOpStatus {
    Pending,
    Completed,
    Failed,
}

/// A column value in a Sync Operation payload, modeled as a tagged variant
/// rather than an untyped map (REDESIGN FLAGS: "Dynamic payload
/// dictionaries"). Scalars round-trip verbatim; timestamps serialize as
/// ISO-8601 text; nested containers serialize as JSON text. Binary blobs are
/// disallowed per spec.md §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// The replication log element. See spec.md §3 "Sync Operation".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Monotonic id derived from timestamp + origin node.
    pub id: String,
    pub kind: SyncOpKind,
    pub table_name: String,
    pub payload: std::collections::BTreeMap<String, ColumnValue>,
    pub origin_node: String,
    pub target_nodes: Vec<String>,
    pub status: SyncOpStatus,
    pub created_at: DateTime<Utc>,
}

impl SyncOperation {
    /// Derives a monotonic operation id from a timestamp and origin node
    /// name, per spec.md §3: "operation identity derived from timestamp +
    /// origin node".
    pub fn derive_id(created_at: DateTime<Utc>, origin_node: &str, seq: u64) -> String {
        format!("{}-{}-{}", created_at.timestamp_nanos_opt().unwrap_or(0), origin_node, seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverOutcome {
    Completed,
    Failed,
}

/// Append-only history entry. See spec.md §3 "Failover Event".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub timestamp: DateTime<Utc>,
    pub source_node: String,
    pub target_node: String,
    pub reason: String,
    pub outcome: FailoverOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_transitions_are_monotonic() {
        use CrawlSessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn terminal_statuses() {
        assert!(CrawlSessionStatus::Completed.is_terminal());
        assert!(CrawlSessionStatus::Failed.is_terminal());
        assert!(!CrawlSessionStatus::Running.is_terminal());
    }

    #[test]
    fn queue_priority_orders_ascending_numeric_priority_first() {
        let lower = QueuePriority { priority: 0.1, seq: 5 };
        let higher = QueuePriority { priority: 0.9, seq: 1 };
        // Smaller numeric priority must compare as "greater" so a max-heap
        // pops it first.
        assert!(lower > higher);
    }

    #[test]
    fn queue_priority_tiebreaks_on_sequence() {
        let a = QueuePriority { priority: 0.5, seq: 1 };
        let b = QueuePriority { priority: 0.5, seq: 2 };
        assert!(a > b, "earlier sequence number should be dequeued first");
    }

    #[test]
    fn failover_candidate_requires_healthy_secondary_or_standby() {
        let mut n = NodeDescriptor {
            name: "s1".into(),
            role: NodeRole::Secondary,
            priority: 2,
            address: "s1:5432".into(),
            database_url: "postgres://s1".into(),
            health: NodeHealth::Healthy,
            consecutive_failures: 0,
            replication_lag_secs: 0.0,
            last_probe: None,
            last_error: None,
        };
        assert!(n.is_failover_candidate());
        n.health = NodeHealth::Offline;
        assert!(!n.is_failover_candidate());
        n.health = NodeHealth::Healthy;
        n.role = NodeRole::Primary;
        assert!(!n.is_failover_candidate());
    }
}
