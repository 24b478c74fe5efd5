use anyhow::Result;
use icrawl_core::config::AppConfig;
use icrawl_storage::Storage;

/// `icrawl search`: lists downloaded images, optionally filtered by category
/// slug. Replaces the teacher's full-text/entity search (there is no text or
/// entity content in an image crawl) with the image listing spec.md §6
/// expects callers to query directly against `images`.
pub async fn run(config: AppConfig, category: Option<String>, limit: i64) -> Result<()> {
    let local = config
        .cluster
        .nodes
        .iter()
        .find(|n| n.name == config.cluster.local_node_name)
        .ok_or_else(|| {
            anyhow::anyhow!("local_node_name {:?} not found in cluster.nodes", config.cluster.local_node_name)
        })?;
    let storage = Storage::new(&local.database_url).await?;
    let repo = storage.repository();

    let category_id = match category {
        Some(slug) => {
            let categories = repo.list_categories().await?;
            let matched = categories.into_iter().find(|c| c.slug == slug);
            match matched {
                Some(c) => Some(c.id),
                None => {
                    println!("No category with slug {slug:?}");
                    return Ok(());
                }
            }
        }
        None => None,
    };

    let images = repo.list_images(category_id, limit, 0).await?;
    println!("Found {} images:\n", images.len());
    for img in images {
        println!(
            "  [{}] {} ({}x{}, {} bytes) -> {}",
            img.id,
            img.url,
            img.width.unwrap_or(0),
            img.height.unwrap_or(0),
            img.file_size.unwrap_or(0),
            img.local_path.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
