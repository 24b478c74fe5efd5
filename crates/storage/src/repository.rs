use anyhow::Result;
use chrono::{DateTime, Utc};
use icrawl_core::{Category, CrawlSession, CrawlSessionStatus, ImageRecord};
use sqlx::PgPool;

fn status_str(status: CrawlSessionStatus) -> &'static str {
    match status {
        CrawlSessionStatus::Pending => "pending",
        CrawlSessionStatus::Running => "running",
        CrawlSessionStatus::Completed => "completed",
        CrawlSessionStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> CrawlSessionStatus {
    match s {
        "running" => CrawlSessionStatus::Running,
        "completed" => CrawlSessionStatus::Completed,
        "failed" => CrawlSessionStatus::Failed,
        _ => CrawlSessionStatus::Pending,
    }
}

/// Typed CRUD over the replicated tables. See spec.md §6; grounded on the
/// teacher's `store_page` query shapes, generalized from page-scoped
/// heading/entity/link inserts to the image-crawler schema.
#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_or_create_uncategorized(&self) -> Result<i64> {
        if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM categories WHERE slug = $1")
            .bind("uncategorized")
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(id);
        }
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO categories (name, slug, description, is_visible) \
             VALUES ('Uncategorized', 'uncategorized', 'Default category for unclassified images', TRUE) \
             ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug \
             RETURNING id",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let row = sqlx::query_as::<_, CategoryRow>(
            "SELECT id, name, slug, parent_id, image_count, total_size, is_visible, created_at, updated_at, status \
             FROM categories WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        let rows = sqlx::query_as::<_, CategoryRow>(
            "SELECT id, name, slug, parent_id, image_count, total_size, is_visible, created_at, updated_at, status \
             FROM categories WHERE status = 'active' ORDER BY sort_order, name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get_image(&self, id: i64) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRow>(
            "SELECT id, url, source_url, filename, file_extension, mime_type, file_size, width, height, \
                    md5_hash, sha256_hash, category_id, local_path, is_downloaded, download_attempts, \
                    last_download_error, created_at, updated_at, status \
             FROM images WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list_images(&self, category_id: Option<i64>, limit: i64, offset: i64) -> Result<Vec<ImageRecord>> {
        let rows = match category_id {
            Some(cat) => {
                sqlx::query_as::<_, ImageRow>(
                    "SELECT id, url, source_url, filename, file_extension, mime_type, file_size, width, height, \
                            md5_hash, sha256_hash, category_id, local_path, is_downloaded, download_attempts, \
                            last_download_error, created_at, updated_at, status \
                     FROM images WHERE status = 'active' AND category_id = $1 \
                     ORDER BY id DESC LIMIT $2 OFFSET $3",
                )
                .bind(cat)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ImageRow>(
                    "SELECT id, url, source_url, filename, file_extension, mime_type, file_size, width, height, \
                            md5_hash, sha256_hash, category_id, local_path, is_downloaded, download_attempts, \
                            last_download_error, created_at, updated_at, status \
                     FROM images WHERE status = 'active' ORDER BY id DESC LIMIT $1 OFFSET $2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count_images(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn soft_delete_image(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE images SET status = 'deleted', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_crawl_session(&self, target_url: &str, max_depth: i32) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO crawl_sessions (target_url, max_depth, status) VALUES ($1, $2, 'pending') RETURNING id",
        )
        .bind(target_url)
        .bind(max_depth)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_crawl_session(&self, id: i64) -> Result<Option<CrawlSession>> {
        let row = sqlx::query_as::<_, CrawlSessionRow>(
            "SELECT id, target_url, status, start_time, end_time, total_pages, processed_pages, \
                    total_images_found, images_downloaded, images_failed, summary_log \
             FROM crawl_sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Transitions a crawl session's status, enforcing
    /// `CrawlSessionStatus::can_transition_to` before issuing the update.
    pub async fn transition_crawl_session(&self, id: i64, next: CrawlSessionStatus) -> Result<()> {
        let current = self
            .get_crawl_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("crawl session {id} not found"))?;
        if !current.status.can_transition_to(next) {
            return Err(anyhow::anyhow!(
                "invalid crawl session transition {:?} -> {:?}",
                current.status,
                next
            ));
        }
        match next {
            CrawlSessionStatus::Running => {
                sqlx::query("UPDATE crawl_sessions SET status = $1, start_time = NOW(), updated_at = NOW() WHERE id = $2")
                    .bind(status_str(next))
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            CrawlSessionStatus::Completed | CrawlSessionStatus::Failed => {
                sqlx::query("UPDATE crawl_sessions SET status = $1, end_time = NOW(), updated_at = NOW() WHERE id = $2")
                    .bind(status_str(next))
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            CrawlSessionStatus::Pending => {
                sqlx::query("UPDATE crawl_sessions SET status = $1, updated_at = NOW() WHERE id = $2")
                    .bind(status_str(next))
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn record_crawl_progress(
        &self,
        id: i64,
        processed_pages: i64,
        total_images_found: i64,
        images_downloaded: i64,
        images_failed: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawl_sessions SET processed_pages = $1, total_images_found = $2, \
             images_downloaded = $3, images_failed = $4, updated_at = NOW() WHERE id = $5",
        )
        .bind(processed_pages)
        .bind(total_images_found)
        .bind(images_downloaded)
        .bind(images_failed)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk-upserts a batch of image rows in one round trip via `UNNEST`,
    /// for reconciliation full-copy and for a crawl session's own batched
    /// image inserts. Grounded on the teacher's batched heading/entity/link
    /// insert pattern in `store_page`.
    pub async fn bulk_upsert_images(&self, rows: &[BulkImageRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let urls: Vec<&str> = rows.iter().map(|r| r.url.as_str()).collect();
        let filenames: Vec<&str> = rows.iter().map(|r| r.filename.as_str()).collect();
        let extensions: Vec<&str> = rows.iter().map(|r| r.file_extension.as_str()).collect();
        let file_sizes: Vec<Option<i64>> = rows.iter().map(|r| r.file_size).collect();
        let widths: Vec<Option<i32>> = rows.iter().map(|r| r.width).collect();
        let heights: Vec<Option<i32>> = rows.iter().map(|r| r.height).collect();
        let md5_hashes: Vec<Option<&str>> = rows.iter().map(|r| r.md5_hash.as_deref()).collect();
        let local_paths: Vec<Option<&str>> = rows.iter().map(|r| r.local_path.as_deref()).collect();
        let category_ids: Vec<Option<i64>> = rows.iter().map(|r| r.category_id).collect();

        let result = sqlx::query(
            "INSERT INTO images (url, filename, file_extension, file_size, width, height, md5_hash, \
                                  local_path, category_id, is_downloaded) \
             SELECT u.url, u.filename, u.file_extension, u.file_size, u.width, u.height, u.md5_hash, \
                    u.local_path, u.category_id, TRUE \
             FROM UNNEST($1::text[], $2::text[], $3::text[], $4::bigint[], $5::int[], \
                          $6::int[], $7::text[], $8::text[], $9::bigint[]) \
                  AS u(url, filename, file_extension, file_size, width, height, md5_hash, local_path, category_id) \
             ON CONFLICT (url) DO UPDATE SET \
                file_size = EXCLUDED.file_size, \
                width = EXCLUDED.width, \
                height = EXCLUDED.height, \
                md5_hash = EXCLUDED.md5_hash, \
                local_path = EXCLUDED.local_path, \
                is_downloaded = TRUE, \
                updated_at = NOW()",
        )
        .bind(&urls)
        .bind(&filenames)
        .bind(&extensions)
        .bind(&file_sizes)
        .bind(&widths)
        .bind(&heights)
        .bind(&md5_hashes)
        .bind(&local_paths)
        .bind(&category_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// One row of a batch submitted to `bulk_upsert_images`.
pub struct BulkImageRow {
    pub url: String,
    pub filename: String,
    pub file_extension: String,
    pub file_size: Option<i64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub md5_hash: Option<String>,
    pub local_path: Option<String>,
    pub category_id: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct CategoryRow {
    id: i64,
    name: String,
    slug: String,
    parent_id: Option<i64>,
    image_count: i64,
    total_size: i64,
    is_visible: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: String,
}

impl From<CategoryRow> for Category {
    fn from(r: CategoryRow) -> Self {
        Category {
            id: r.id,
            name: r.name,
            slug: r.slug,
            parent_id: r.parent_id,
            image_count: r.image_count,
            total_size: r.total_size,
            is_visible: r.is_visible,
            created_at: r.created_at,
            updated_at: r.updated_at,
            status: r.status,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: i64,
    url: String,
    source_url: Option<String>,
    filename: String,
    file_extension: String,
    mime_type: Option<String>,
    file_size: Option<i64>,
    width: Option<i32>,
    height: Option<i32>,
    md5_hash: Option<String>,
    sha256_hash: Option<String>,
    category_id: Option<i64>,
    local_path: Option<String>,
    is_downloaded: bool,
    download_attempts: i32,
    last_download_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: String,
}

impl From<ImageRow> for ImageRecord {
    fn from(r: ImageRow) -> Self {
        ImageRecord {
            id: r.id,
            url: r.url,
            source_url: r.source_url,
            filename: r.filename,
            file_extension: r.file_extension,
            mime_type: r.mime_type,
            file_size: r.file_size,
            width: r.width,
            height: r.height,
            md5_hash: r.md5_hash,
            sha256_hash: r.sha256_hash,
            category_id: r.category_id,
            local_path: r.local_path,
            is_downloaded: r.is_downloaded,
            download_attempts: r.download_attempts,
            last_download_error: r.last_download_error,
            created_at: r.created_at,
            updated_at: r.updated_at,
            status: r.status,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CrawlSessionRow {
    id: i64,
    target_url: String,
    status: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    total_pages: i64,
    processed_pages: i64,
    total_images_found: i64,
    images_downloaded: i64,
    images_failed: i64,
    summary_log: Option<String>,
}

impl From<CrawlSessionRow> for CrawlSession {
    fn from(r: CrawlSessionRow) -> Self {
        CrawlSession {
            id: r.id,
            target_url: r.target_url,
            status: parse_status(&r.status),
            start_time: r.start_time,
            end_time: r.end_time,
            total_pages: r.total_pages,
            processed_pages: r.processed_pages,
            total_images_found: r.total_images_found,
            images_downloaded: r.images_downloaded,
            images_failed: r.images_failed,
            summary_log: r.summary_log,
        }
    }
}
