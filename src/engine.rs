use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use icrawl_core::{ColumnValue, CrawlerConfig, DownloadTask, FetchConfig, PageTask};
use icrawl_frontier::Frontier;
use icrawl_storage::{AutoSyncFlag, AutoSyncSession, PgSession, Session, SyncPublisher};
use icrawl_transport::SessionTransport;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long a worker blocks on an empty queue before re-checking the stop
/// predicate, per spec.md §4.5 ("block ... with a short timeout").
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Replaces the teacher's `src/crawl.rs` network-driver worker topology
/// (Tor/I2P/Zeronet/etc. drivers) with the two-queue page/download worker
/// pool of spec.md §4.5, running against a single `SessionTransport`
/// instead of per-darknet drivers.
pub struct CrawlEngineConfig {
    pub max_concurrent: usize,
    pub max_depth: u32,
    pub max_images: usize,
    pub max_pages: usize,
    pub fetch: FetchConfig,
    pub download_dir: PathBuf,
    pub max_retries: u32,
}

impl CrawlEngineConfig {
    pub fn from_crawler_config(c: &CrawlerConfig, download_dir: PathBuf) -> Self {
        Self {
            max_concurrent: c.max_concurrent,
            max_depth: c.max_depth,
            max_images: c.max_images,
            max_pages: c.max_pages,
            fetch: FetchConfig::default(),
            download_dir,
            max_retries: c.anti_scraping.max_retries,
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CrawlStats {
    pub pages_crawled: usize,
    pub images_found: usize,
    pub images_downloaded: usize,
    pub images_failed: usize,
    pub duration_secs: f64,
    pub pages_per_sec: f64,
    pub images_per_sec: f64,
    pub success_rate: f64,
}

/// Result document returned on completion, per spec.md §4.5's closing
/// paragraph: counts, duration, throughput, the found/downloaded/failed URL
/// sets, and the URL→filename map (the authoritative record for persisted
/// image rows).
pub struct CrawlEngineResult {
    pub stats: CrawlStats,
    pub found_images: Vec<String>,
    pub downloaded_images: Vec<String>,
    pub failed_urls: Vec<String>,
}

pub struct CrawlEngine {
    frontier: Arc<Frontier>,
    transport: Arc<SessionTransport>,
    config: CrawlEngineConfig,
    stop: Arc<AtomicBool>,
    pages_crawled: Arc<AtomicUsize>,
    images_failed: Arc<AtomicUsize>,
    pool: PgPool,
    publisher: Arc<dyn SyncPublisher>,
    auto_sync_enabled: AutoSyncFlag,
    category_id: i64,
}

impl CrawlEngine {
    pub fn new(
        transport: SessionTransport,
        config: CrawlEngineConfig,
        pool: PgPool,
        publisher: Arc<dyn SyncPublisher>,
        auto_sync_enabled: AutoSyncFlag,
        category_id: i64,
    ) -> Self {
        Self {
            frontier: Arc::new(Frontier::new()),
            transport: Arc::new(transport),
            config,
            stop: Arc::new(AtomicBool::new(false)),
            pages_crawled: Arc::new(AtomicUsize::new(0)),
            images_failed: Arc::new(AtomicUsize::new(0)),
            pool,
            publisher,
            auto_sync_enabled,
            category_id,
        }
    }

    /// Sets the stop flag observed by every worker at the top of its loop,
    /// per spec.md §4.5's cancellation contract.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub async fn seed(&self, url: String) {
        self.frontier
            .enqueue_page(PageTask { url, depth: 0, source_url: None, priority: 0.0, retry_count: 0, seq: 0 })
            .await;
    }

    pub async fn run(&self) -> Result<CrawlEngineResult> {
        let started = Instant::now();
        let page_workers = self.config.max_concurrent.min(5);
        let download_workers = self.config.max_concurrent;
        info!(page_workers, download_workers, "starting crawl engine worker pool");

        let mut workers = JoinSet::new();
        for id in 0..page_workers {
            let this = self.clone_handles();
            workers.spawn(async move { this.page_loop(id).await });
        }
        for id in 0..download_workers {
            let this = self.clone_handles();
            workers.spawn(async move { this.download_loop(id).await });
        }

        while workers.join_next().await.is_some() {}

        let duration_secs = started.elapsed().as_secs_f64().max(0.001);
        let pages_crawled = self.pages_crawled.load(Ordering::SeqCst);
        let downloaded = self.frontier.downloaded_images.len();
        let failed = self.images_failed.load(Ordering::SeqCst);
        let attempted = downloaded + failed;
        let stats = CrawlStats {
            pages_crawled,
            images_found: self.frontier.found_images.len(),
            images_downloaded: downloaded,
            images_failed: failed,
            duration_secs,
            pages_per_sec: pages_crawled as f64 / duration_secs,
            images_per_sec: downloaded as f64 / duration_secs,
            success_rate: if attempted == 0 { 1.0 } else { downloaded as f64 / attempted as f64 },
        };

        Ok(CrawlEngineResult {
            stats,
            found_images: self.frontier.found_images.iter().map(|e| e.clone()).collect(),
            downloaded_images: self.frontier.downloaded_images.iter().map(|e| e.clone()).collect(),
            failed_urls: self.frontier.failed_urls.iter().map(|e| e.clone()).collect(),
        })
    }

    /// Cheap struct of `Arc` clones so each spawned worker owns its own
    /// handle without borrowing `self`.
    fn clone_handles(&self) -> WorkerHandles {
        WorkerHandles {
            frontier: self.frontier.clone(),
            transport: self.transport.clone(),
            max_depth: self.config.max_depth,
            max_images: self.config.max_images,
            max_pages: self.config.max_pages,
            max_retries: self.config.max_retries,
            fetch: self.config.fetch.clone(),
            download_dir: self.config.download_dir.clone(),
            stop: self.stop.clone(),
            pages_crawled: self.pages_crawled.clone(),
            images_failed: self.images_failed.clone(),
            pool: self.pool.clone(),
            publisher: self.publisher.clone(),
            auto_sync_enabled: self.auto_sync_enabled.clone(),
            category_id: self.category_id,
        }
    }

}

#[derive(Clone)]
struct WorkerHandles {
    frontier: Arc<Frontier>,
    transport: Arc<SessionTransport>,
    max_depth: u32,
    max_images: usize,
    max_pages: usize,
    max_retries: u32,
    fetch: FetchConfig,
    download_dir: PathBuf,
    stop: Arc<AtomicBool>,
    pages_crawled: Arc<AtomicUsize>,
    images_failed: Arc<AtomicUsize>,
    pool: PgPool,
    publisher: Arc<dyn SyncPublisher>,
    auto_sync_enabled: AutoSyncFlag,
    category_id: i64,
}

impl WorkerHandles {
    fn should_terminate(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
            || self.pages_crawled.load(Ordering::SeqCst) >= self.max_pages
            || self.frontier.downloaded_images.len() >= self.max_images
    }

    /// Page worker algorithm, spec.md §4.5.
    async fn page_loop(&self, id: usize) {
        debug!(worker = id, "page worker started");
        loop {
            if self.should_terminate() {
                break;
            }
            let Some(task) = self.frontier.dequeue_page().await else {
                if self.should_terminate() && self.frontier.crawl_queue_is_empty().await {
                    break;
                }
                tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                continue;
            };

            if icrawl_core::url_analyzer::is_image(&task.url, false)
                || self.frontier.visited_urls.contains(&task.url)
                || task.depth > self.max_depth
                || self.pages_crawled.load(Ordering::SeqCst) >= self.max_pages
            {
                continue;
            }
            self.frontier.mark_visited(&task.url);

            match self.transport.get(&task.url, &self.fetch).await {
                Ok(resp) if resp.status == 200 && is_text_content(resp.content_type.as_deref()) => {
                    let parsed = {
                        let resp = resp.clone();
                        tokio::task::spawn_blocking(move || icrawl_parser::parse_response(&resp))
                            .await
                            .unwrap_or_else(|e| {
                                warn!(worker = id, url = %task.url, error = %e, "parse task panicked");
                                icrawl_parser::PageParseResult { title: None, images: vec![], links: vec![], body_hash: String::new() }
                            })
                    };

                    let mut new_images = 0usize;
                    for image_url in &parsed.images {
                        let download = DownloadTask {
                            url: image_url.clone(),
                            source_url: Some(task.url.clone()),
                            filename: None,
                            priority: task.priority,
                            retry_count: 0,
                            seq: 0,
                        };
                        if self.frontier.enqueue_image(download).await {
                            new_images += 1;
                        }
                    }

                    let mut new_links = 0usize;
                    if task.depth < self.max_depth {
                        for link in &parsed.links {
                            let next = PageTask {
                                url: link.clone(),
                                depth: task.depth + 1,
                                source_url: Some(task.url.clone()),
                                priority: 1.0 / (task.depth as f64 + 2.0),
                                retry_count: 0,
                                seq: 0,
                            };
                            if self.frontier.enqueue_page(next).await {
                                new_links += 1;
                            }
                        }
                    }

                    self.pages_crawled.fetch_add(1, Ordering::SeqCst);
                    debug!(worker = id, url = %task.url, new_images, new_links, "page processed");
                }
                Ok(resp) => {
                    debug!(worker = id, url = %task.url, status = resp.status, "skipping non-text or non-200 response");
                }
                Err(e) => {
                    self.handle_page_failure(id, task, e).await;
                }
            }
        }
        debug!(worker = id, "page worker exiting");
    }

    async fn handle_page_failure(&self, id: usize, mut task: PageTask, err: icrawl_core::CrawlError) {
        task.retry_count += 1;
        if task.retry_count > self.max_retries {
            warn!(worker = id, url = %task.url, error = %err, "page permanently failed");
            self.frontier.mark_failed(&task.url);
        } else {
            warn!(worker = id, url = %task.url, retry = task.retry_count, error = %err, "page fetch failed, retrying");
            self.frontier.requeue_page(task).await;
        }
    }

    /// Download worker algorithm, spec.md §4.5 ("mirror of the above against
    /// `download_queue`").
    async fn download_loop(&self, id: usize) {
        debug!(worker = id, "download worker started");
        loop {
            if self.should_terminate() {
                break;
            }
            let Some(task) = self.frontier.dequeue_download().await else {
                if self.should_terminate() && self.frontier.download_queue_is_empty().await {
                    break;
                }
                tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                continue;
            };

            let outcome = icrawl_downloader::download(
                &self.transport,
                &task.url,
                task.filename.clone(),
                self.max_retries.saturating_sub(task.retry_count),
                self.fetch.timeout,
                &self.download_dir,
            )
            .await;

            if outcome.success {
                let filename = outcome.local_path.as_deref().and_then(|p| p.rsplit('/').next()).unwrap_or_default();
                self.frontier.mark_downloaded(&task.url, filename);
                if let Err(e) = self.persist_image(&task, filename, &outcome).await {
                    warn!(worker = id, url = %task.url, error = %e, "failed to persist image row");
                }
                debug!(worker = id, url = %task.url, "image downloaded");
            } else if task.retry_count < self.max_retries {
                let mut retry_task = task;
                retry_task.retry_count += 1;
                self.frontier.requeue_download(retry_task).await;
            } else {
                warn!(worker = id, url = %task.url, error = ?outcome.error, "image permanently failed");
                self.frontier.mark_failed(&task.url);
                self.images_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
        debug!(worker = id, "download worker exiting");
    }

    /// Writes the image row through the Auto-Sync Session so the insert is
    /// captured into the replication log when this node is primary, per
    /// spec.md §4.8.
    async fn persist_image(&self, task: &DownloadTask, filename: &str, outcome: &icrawl_downloader::DownloadOutcome) -> Result<()> {
        let mut payload = BTreeMap::new();
        payload.insert("url".to_string(), ColumnValue::Text(task.url.clone()));
        if let Some(source) = &task.source_url {
            payload.insert("source_url".to_string(), ColumnValue::Text(source.clone()));
        }
        payload.insert("filename".to_string(), ColumnValue::Text(filename.to_string()));
        let extension = filename.rsplit('.').next().unwrap_or("bin").to_string();
        payload.insert("file_extension".to_string(), ColumnValue::Text(extension));
        if let Some(size) = outcome.file_size {
            payload.insert("file_size".to_string(), ColumnValue::Int(size as i64));
        }
        if let Some(w) = outcome.width {
            payload.insert("width".to_string(), ColumnValue::Int(w as i64));
        }
        if let Some(h) = outcome.height {
            payload.insert("height".to_string(), ColumnValue::Int(h as i64));
        }
        if let Some(md5) = &outcome.md5_hash {
            payload.insert("md5_hash".to_string(), ColumnValue::Text(md5.clone()));
        }
        if let Some(path) = &outcome.local_path {
            payload.insert("local_path".to_string(), ColumnValue::Text(path.clone()));
        }
        payload.insert("category_id".to_string(), ColumnValue::Int(self.category_id));
        payload.insert("is_downloaded".to_string(), ColumnValue::Bool(true));

        let mut session = AutoSyncSession::new(
            PgSession::new(self.pool.clone()),
            self.publisher.clone(),
            self.auto_sync_enabled.clone(),
        );
        session.begin().await?;
        match session.insert("images", payload).await {
            Ok(_) => session.commit().await,
            Err(e) => {
                session.rollback().await.ok();
                Err(e)
            }
        }
    }
}

fn is_text_content(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.contains("html") || ct.contains("xml") || ct.contains("text")
        }
        None => true,
    }
}
