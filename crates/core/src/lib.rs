pub mod config;
pub mod error;
pub mod types;
pub mod url_analyzer;

pub use config::AppConfig;
pub use error::{ClusterError, CrawlError};
pub use types::*;
