use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("file error: {0}")]
    File(String),

    #[error("image validation failed: {0}")]
    InvalidImage(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the HA cluster layer. Kept distinct from `CrawlError`
/// so callers can tell crawl-side failures from cluster-side ones without
/// matching on string content.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("no healthy node available for write")]
    NoHealthyPrimary,

    #[error("schema error on node {node}: {reason}")]
    Schema { node: String, reason: String },

    #[error("replication apply failed on {node}: {reason}")]
    Replication { node: String, reason: String },

    #[error("failover already in progress")]
    FailoverInProgress,

    #[error("no failover candidate available")]
    NoFailoverCandidate,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
