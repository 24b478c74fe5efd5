use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "icrawl", about = "Distributed, highly-available image crawler")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl a site for images, starting the cluster background workers alongside it
    Crawl {
        /// Seed URL to start crawling from
        #[arg(long)]
        seed: String,

        /// Maximum crawl depth (overrides config)
        #[arg(short, long)]
        depth: Option<u32>,

        /// Maximum images to download (overrides config)
        #[arg(long)]
        max_images: Option<u64>,
    },
    /// Run as a long-lived node: starts the cluster background workers and the
    /// Inter-Node RPC / control-plane HTTP server, without crawling anything itself
    Serve,
    /// Show local database stats and cluster node health
    Status,
    /// List downloaded images
    Search {
        /// Filter by category slug
        #[arg(short, long)]
        category: Option<String>,

        /// Max results
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Trigger a manual failover away from the current primary
    Failover {
        /// Preferred failover target node name (falls back to the lowest-priority
        /// healthy candidate if omitted or unreachable)
        #[arg(long)]
        target: Option<String>,
    },
}
