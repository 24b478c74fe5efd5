mod cli;
mod commands;
mod engine;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dashmap::DashMap;
use icrawl_core::config::{AppConfig, NodeConfig};
use icrawl_rpc::HttpRoleChangeNotifier;
use icrawl_storage::Storage;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let config: AppConfig = toml::from_str(&config_str)?;

    match cli.command {
        Commands::Crawl { seed, depth, max_images } => run_crawl(config, seed, depth, max_images).await,
        Commands::Serve => run_serve(config).await,
        Commands::Status => commands::status::run(config).await,
        Commands::Search { category, limit } => commands::search::run(config, category, limit).await,
        Commands::Failover { target } => run_failover(config, target).await,
    }
}

fn local_node(config: &AppConfig) -> Result<&NodeConfig> {
    config
        .cluster
        .nodes
        .iter()
        .find(|n| n.name == config.cluster.local_node_name)
        .ok_or_else(|| anyhow::anyhow!("local_node_name {:?} not found in cluster.nodes", config.cluster.local_node_name))
}

/// Peer control-plane addresses for role-change RPC notification, keyed by
/// node name, built once from the static cluster config (spec.md §4.10).
fn peer_addresses(config: &AppConfig) -> Arc<DashMap<String, String>> {
    let map = DashMap::new();
    for node in &config.cluster.nodes {
        map.insert(node.name.clone(), node.address.clone());
    }
    Arc::new(map)
}

async fn build_cluster(config: &AppConfig) -> Result<Arc<icrawl_cluster::Cluster>> {
    let notifier = Arc::new(HttpRoleChangeNotifier::new(peer_addresses(config)));
    let cluster = icrawl_cluster::Cluster::connect(&config.cluster, &config.sync, &config.failover, Some(notifier)).await?;
    Ok(Arc::new(cluster))
}

/// `icrawl crawl --seed <url>`: runs one crawl session to completion,
/// keeping the cluster's background workers (health monitor, incremental
/// sync, full reconciliation) alive alongside it so the downloads this node
/// persists are replicated the same as on a long-lived `serve` node.
async fn run_crawl(config: AppConfig, seed: String, depth: Option<u32>, max_images: Option<u64>) -> Result<()> {
    let local = local_node(&config)?.clone();
    let storage = Storage::new(&local.database_url).await?;
    storage.run_migrations().await?;

    let cluster = build_cluster(&config).await?;
    let handles = cluster.start();

    let transport = icrawl_transport::SessionTransport::new(&config.crawler.anti_scraping)?;
    let mut engine_config = icrawl_engine_config(&config);
    if let Some(d) = depth {
        engine_config.max_depth = d;
    }
    if let Some(m) = max_images {
        engine_config.max_images = m as usize;
    }

    let repo = storage.repository();
    let category_id = repo.get_or_create_uncategorized().await?;
    let session_id = repo.create_crawl_session(&seed, engine_config.max_depth as i32).await?;
    repo.transition_crawl_session(session_id, icrawl_core::CrawlSessionStatus::Running).await?;

    let publisher = cluster.publisher();
    let crawl_engine = engine::CrawlEngine::new(
        transport,
        engine_config,
        storage.pool().clone(),
        publisher,
        cluster.auto_sync_enabled.clone(),
        category_id,
    );
    crawl_engine.seed(seed).await;

    let result = crawl_engine.run().await;

    match &result {
        Ok(r) => {
            repo.record_crawl_progress(
                session_id,
                r.stats.pages_crawled as i64,
                r.stats.images_found as i64,
                r.stats.images_downloaded as i64,
                r.stats.images_failed as i64,
            )
            .await?;
            repo.transition_crawl_session(session_id, icrawl_core::CrawlSessionStatus::Completed).await?;
            println!(
                "crawled {} pages, found {}, downloaded {}, failed {} ({:.1}s, {:.1} img/s)",
                r.stats.pages_crawled,
                r.stats.images_found,
                r.stats.images_downloaded,
                r.stats.images_failed,
                r.stats.duration_secs,
                r.stats.images_per_sec,
            );
        }
        Err(e) => {
            repo.transition_crawl_session(session_id, icrawl_core::CrawlSessionStatus::Failed).await?;
            warn!(error = %e, "crawl run failed");
        }
    }

    cluster.stop();
    for h in handles {
        let _ = h.await;
    }
    result.map(|_| ())
}

fn icrawl_engine_config(config: &AppConfig) -> engine::CrawlEngineConfig {
    engine::CrawlEngineConfig::from_crawler_config(&config.crawler, PathBuf::from(&config.general.download_path))
}

/// `icrawl serve`: runs this node as a standing cluster member — background
/// HA workers plus the Inter-Node RPC / control-plane HTTP server — without
/// crawling anything itself. Crawls are submitted via `POST /crawl`.
async fn run_serve(config: AppConfig) -> Result<()> {
    let local = local_node(&config)?.clone();
    let storage = Storage::new(&local.database_url).await?;
    storage.run_migrations().await?;

    let cluster = build_cluster(&config).await?;
    let handles = cluster.start();

    let state = icrawl_rpc::AppState { cluster: cluster.clone(), local_storage: storage };
    let router = icrawl_rpc::router(state);
    let addr = format!("{}:{}", config.rpc.bind_addr, config.rpc.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, node = %local.name, "serving Inter-Node RPC and control-plane API");
    axum::serve(listener, router).await?;

    cluster.stop();
    for h in handles {
        let _ = h.await;
    }
    Ok(())
}

/// `icrawl failover [--target NODE]`: triggers the same path the Health
/// Monitor would on an offline primary, without waiting for a real outage.
async fn run_failover(config: AppConfig, target: Option<String>) -> Result<()> {
    let cluster = build_cluster(&config).await?;
    let Some(primary) = cluster.registry.primary_name() else {
        println!("no primary known, nothing to fail over from");
        return Ok(());
    };
    if let Some(target) = &target {
        info!(primary, target, "manual failover requested with a preferred target");
    }
    cluster.failover.on_node_unreachable(&primary, "manual failover requested via CLI").await;
    let state = cluster.failover.state().await;
    println!("failover state: {state:?}");
    for event in cluster.failover.history().await {
        println!("  {:?}", event);
    }
    Ok(())
}
