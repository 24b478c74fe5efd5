use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use icrawl_core::{DownloadTask, PageTask, QueuePriority};
use priority_queue::PriorityQueue;
use tokio::sync::Mutex;

/// Generalizes the teacher's per-network `NetworkQueue` (priority queue plus
/// side-table of job bodies, both behind one lock) into a single queue keyed
/// by URL, carrying an arbitrary task payload. See spec.md §4.5.
struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    queue: PriorityQueue<String, QueuePriority>,
    jobs: HashMap<String, T>,
}

impl<T> TaskQueue<T> {
    fn new() -> Self {
        Self { inner: Mutex::new(Inner { queue: PriorityQueue::new(), jobs: HashMap::new() }) }
    }

    async fn push(&self, url: String, priority: QueuePriority, task: T) {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(url.clone(), task);
        inner.queue.push(url, priority);
    }

    async fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().await;
        let (url, _) = inner.queue.pop()?;
        inner.jobs.remove(&url)
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    async fn is_empty(&self) -> bool {
        self.inner.lock().await.queue.is_empty()
    }
}

/// The Crawl Engine's dual work queues, membership sets, and the
/// URL→filename map. Per spec.md §3 "Ownership": "the Crawl Engine owns the
/// two in-memory work queues and all discovered-URL / visited-URL sets;
/// nothing outside it may mutate them" — this type is that owned state,
/// generalized from `darkscraper-frontier::CrawlFrontier`.
pub struct Frontier {
    crawl_queue: TaskQueue<PageTask>,
    download_queue: TaskQueue<DownloadTask>,
    pub visited_urls: DashSet<String>,
    pub found_images: DashSet<String>,
    pub downloaded_images: DashSet<String>,
    pub failed_urls: DashSet<String>,
    pub url_to_filename: DashMap<String, String>,
    seq: AtomicU64,
}

impl Default for Frontier {
    fn default() -> Self {
        Self::new()
    }
}

impl Frontier {
    pub fn new() -> Self {
        Self {
            crawl_queue: TaskQueue::new(),
            download_queue: TaskQueue::new(),
            visited_urls: DashSet::new(),
            found_images: DashSet::new(),
            downloaded_images: DashSet::new(),
            failed_urls: DashSet::new(),
            url_to_filename: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueues a page task unless its URL has already been visited. Returns
    /// whether it was newly enqueued.
    pub async fn enqueue_page(&self, mut task: PageTask) -> bool {
        if self.visited_urls.contains(&task.url) {
            return false;
        }
        task.seq = self.next_seq();
        let priority = QueuePriority { priority: task.priority, seq: task.seq };
        let url = task.url.clone();
        self.crawl_queue.push(url, priority, task).await;
        true
    }

    /// Enqueues an image download task unless the URL is already a known
    /// image (deduped against `found_images`, per spec.md §4.5 step 4).
    pub async fn enqueue_image(&self, mut task: DownloadTask) -> bool {
        if !self.found_images.insert(task.url.clone()) {
            return false;
        }
        task.seq = self.next_seq();
        let priority = QueuePriority { priority: task.priority, seq: task.seq };
        let url = task.url.clone();
        self.download_queue.push(url, priority, task).await;
        true
    }

    /// Re-enqueues a page task that failed, preserving its retry count. Used
    /// by the retry path; bypasses the `visited_urls` check since the URL is
    /// already marked visited.
    pub async fn requeue_page(&self, mut task: PageTask) {
        task.seq = self.next_seq();
        let priority = QueuePriority { priority: task.priority, seq: task.seq };
        let url = task.url.clone();
        self.crawl_queue.push(url, priority, task).await;
    }

    pub async fn requeue_download(&self, mut task: DownloadTask) {
        task.seq = self.next_seq();
        let priority = QueuePriority { priority: task.priority, seq: task.seq };
        let url = task.url.clone();
        self.download_queue.push(url, priority, task).await;
    }

    pub async fn dequeue_page(&self) -> Option<PageTask> {
        self.crawl_queue.pop().await
    }

    pub async fn dequeue_download(&self) -> Option<DownloadTask> {
        self.download_queue.pop().await
    }

    pub fn mark_visited(&self, url: &str) {
        self.visited_urls.insert(url.to_string());
    }

    pub fn mark_downloaded(&self, url: &str, filename: &str) {
        self.downloaded_images.insert(url.to_string());
        self.url_to_filename.insert(url.to_string(), filename.to_string());
    }

    pub fn mark_failed(&self, url: &str) {
        self.failed_urls.insert(url.to_string());
    }

    pub async fn crawl_queue_len(&self) -> usize {
        self.crawl_queue.len().await
    }

    pub async fn download_queue_len(&self) -> usize {
        self.download_queue.len().await
    }

    pub async fn crawl_queue_is_empty(&self) -> bool {
        self.crawl_queue.is_empty().await
    }

    pub async fn download_queue_is_empty(&self) -> bool {
        self.download_queue.is_empty().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, priority: f64) -> PageTask {
        PageTask { url: url.to_string(), depth: 0, source_url: None, priority, retry_count: 0, seq: 0 }
    }

    fn image(url: &str, priority: f64) -> DownloadTask {
        DownloadTask { url: url.to_string(), source_url: None, filename: None, priority, retry_count: 0, seq: 0 }
    }

    #[tokio::test]
    async fn enqueue_page_skips_already_visited_urls() {
        let frontier = Frontier::new();
        frontier.mark_visited("https://example.com/a");
        assert!(!frontier.enqueue_page(page("https://example.com/a", 0.5)).await);
        assert_eq!(frontier.crawl_queue_len().await, 0);
    }

    #[tokio::test]
    async fn dequeue_page_pops_lowest_numeric_priority_first() {
        let frontier = Frontier::new();
        frontier.enqueue_page(page("https://example.com/low", 0.9)).await;
        frontier.enqueue_page(page("https://example.com/high", 0.1)).await;
        let first = frontier.dequeue_page().await.unwrap();
        assert_eq!(first.url, "https://example.com/high");
    }

    #[tokio::test]
    async fn enqueue_image_dedups_against_found_images() {
        let frontier = Frontier::new();
        assert!(frontier.enqueue_image(image("https://example.com/x.jpg", 0.5)).await);
        assert!(!frontier.enqueue_image(image("https://example.com/x.jpg", 0.5)).await);
        assert_eq!(frontier.download_queue_len().await, 1);
    }

    #[tokio::test]
    async fn mark_downloaded_populates_url_to_filename_map() {
        let frontier = Frontier::new();
        frontier.mark_downloaded("https://example.com/x.jpg", "x.jpg");
        assert!(frontier.downloaded_images.contains("https://example.com/x.jpg"));
        assert_eq!(frontier.url_to_filename.get("https://example.com/x.jpg").map(|v| v.clone()), Some("x.jpg".to_string()));
    }

    #[tokio::test]
    async fn fifo_ties_broken_by_sequence_number() {
        let frontier = Frontier::new();
        frontier.enqueue_page(page("https://example.com/first", 0.5)).await;
        frontier.enqueue_page(page("https://example.com/second", 0.5)).await;
        let first = frontier.dequeue_page().await.unwrap();
        assert_eq!(first.url, "https://example.com/first");
    }
}
