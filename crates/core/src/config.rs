use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub crawler: CrawlerConfig,
    pub cluster: ClusterConfig,
    pub sync: SyncConfig,
    pub failover: FailoverConfig,
    pub rpc: RpcConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub download_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_images")]
    pub max_images: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u64,
    #[serde(default)]
    pub anti_scraping: AntiScrapingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AntiScrapingConfig {
    #[serde(default = "default_true")]
    pub use_random_user_agent: bool,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub proxy_list: Vec<String>,
    #[serde(default = "default_true")]
    pub random_delay: bool,
    #[serde(default = "default_min_delay")]
    pub min_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for AntiScrapingConfig {
    fn default() -> Self {
        Self {
            use_random_user_agent: default_true(),
            use_proxy: false,
            proxy_list: Vec::new(),
            random_delay: default_true(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            max_retries: default_max_retries(),
        }
    }
}

/// One configured cluster peer. Mirrors spec.md §6 "ha: list of nodes".
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub role: String,
    pub priority: i32,
    pub address: String,
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    pub local_node_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub auto_sync_enabled: bool,
    #[serde(default = "default_full_sync_interval")]
    pub full_sync_interval_secs: u64,
    #[serde(default = "default_incremental_sync_interval")]
    pub incremental_sync_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_sync: bool,
    #[serde(default = "default_sync_tables")]
    pub sync_tables: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FailoverConfig {
    #[serde(default)]
    pub enable_auto_failover: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_failover_timeout")]
    pub failover_timeout_secs: u64,
    /// Open question in the source system (see SPEC_FULL.md): whether
    /// failover should block until the new primary has fully caught up, or
    /// proceed best-effort. Defaults to `false` (best-effort).
    #[serde(default)]
    pub wait_for_catchup: bool,
}

/// Binds one combined axum server carrying both the Inter-Node RPC routes
/// and the Control-plane HTTP API stub, per SPEC_FULL.md ("same crate ...
/// reusing its `AppState`" — there is no separate control-plane port).
#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub bind_addr: String,
    pub port: u16,
}

fn default_max_concurrent() -> usize { 10 }
fn default_max_depth() -> u32 { 3 }
fn default_max_images() -> u64 { 1000 }
fn default_max_pages() -> u64 { 100 }
fn default_true() -> bool { true }
fn default_min_delay() -> f64 { 0.5 }
fn default_max_delay() -> f64 { 3.0 }
fn default_max_retries() -> u32 { 3 }
fn default_full_sync_interval() -> u64 { 300 }
fn default_incremental_sync_interval() -> u64 { 10 }
fn default_batch_size() -> usize { 100 }
fn default_max_queue_size() -> usize { 1000 }
fn default_sync_timeout() -> u64 { 30 }
fn default_sync_tables() -> Vec<String> {
    vec!["images".into(), "categories".into(), "crawl_sessions".into(), "tags".into()]
}
fn default_health_check_interval() -> u64 { 30 }
fn default_failure_threshold() -> u32 { 3 }
fn default_detection_threshold() -> u32 { 3 }
fn default_retry_delay() -> u64 { 5 }
fn default_failover_timeout() -> u64 { 60 }
