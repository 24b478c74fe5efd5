use anyhow::Result;
use icrawl_core::config::AppConfig;
use icrawl_storage::Storage;

/// `icrawl status`: local database counts plus a snapshot of every
/// configured cluster peer, replacing the teacher's single-node
/// page/entity/link counters with the image-crawler schema and the HA
/// layer's node list.
pub async fn run(config: AppConfig) -> Result<()> {
    let local = config
        .cluster
        .nodes
        .iter()
        .find(|n| n.name == config.cluster.local_node_name)
        .ok_or_else(|| {
            anyhow::anyhow!("local_node_name {:?} not found in cluster.nodes", config.cluster.local_node_name)
        })?;

    let storage = Storage::new(&local.database_url).await?;
    match storage.health_check().await {
        Ok(()) => println!("Database: connected ({})", local.name),
        Err(e) => {
            println!("Database: ERROR - {}", e);
            return Ok(());
        }
    }

    let repo = storage.repository();
    let images = repo.count_images().await?;
    let categories = repo.list_categories().await?;

    println!("\n== icrawl status ({}) ==", local.name);
    println!("Images downloaded: {}", images);
    println!("Categories:        {}", categories.len());
    println!();
    println!("Cluster nodes:");
    for node in &config.cluster.nodes {
        println!("  {:<16} role={:<10} priority={}", node.name, node.role, node.priority);
    }

    Ok(())
}
