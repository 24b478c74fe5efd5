use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use icrawl_core::config::AntiScrapingConfig;
use icrawl_core::{CrawlError, FetchConfig, FetchResponse};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::user_agents::{ACCEPT_LANGUAGES, USER_AGENTS};

/// HTTP client with rotating user agents, jittered request delay, a proxy
/// pool, and retry-with-backoff. Generalizes the teacher's per-overlay-
/// network `NetworkDriver` implementations (`crates/networks/src/tor.rs`)
/// into the single clearnet transport this spec's crawler needs. See
/// spec.md §4.2.
pub struct SessionTransport {
    /// One client per configured proxy, plus a direct (no-proxy) client at
    /// index 0 when no proxies are configured. Built upfront so that
    /// round-robin proxy selection is just an index pick, mirroring the
    /// teacher's `TorDriver::clients` pool (`crates/networks/src/tor.rs`).
    clients: Vec<reqwest::Client>,
    client_counter: AtomicUsize,
    use_random_user_agent: bool,
    random_delay: bool,
    min_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    last_request_time: Arc<Mutex<Option<Instant>>>,
}

impl SessionTransport {
    pub fn new(config: &AntiScrapingConfig) -> Result<Self, CrawlError> {
        let clients = if config.use_proxy && !config.proxy_list.is_empty() {
            config
                .proxy_list
                .iter()
                .map(|addr| Self::build_client(Some(addr)))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![Self::build_client(None)?]
        };

        Ok(Self {
            clients,
            client_counter: AtomicUsize::new(0),
            use_random_user_agent: config.use_random_user_agent,
            random_delay: config.random_delay,
            min_delay: Duration::from_secs_f64(config.min_delay.max(0.0)),
            max_delay: Duration::from_secs_f64(config.max_delay.max(config.min_delay)),
            max_retries: config.max_retries,
            last_request_time: Arc::new(Mutex::new(None)),
        })
    }

    fn build_client(proxy_addr: Option<&str>) -> Result<reqwest::Client, CrawlError> {
        let mut builder = reqwest::Client::builder().cookie_store(true);
        if let Some(addr) = proxy_addr {
            let proxy = reqwest::Proxy::all(addr).map_err(|e| CrawlError::Proxy(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        builder.build().map_err(|e| CrawlError::Network(e.to_string()))
    }

    /// Round-robins across the configured proxy clients, re-creating none of
    /// them per request (the teacher's `TorDriver::next_client` pattern).
    fn next_client(&self) -> &reqwest::Client {
        let idx = self.client_counter.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }

    fn pick_user_agent(&self) -> &'static str {
        if self.use_random_user_agent {
            let idx = rand::thread_rng().gen_range(0..USER_AGENTS.len());
            USER_AGENTS[idx]
        } else {
            USER_AGENTS[0]
        }
    }

    fn pick_accept_language(&self) -> &'static str {
        let idx = rand::thread_rng().gen_range(0..ACCEPT_LANGUAGES.len());
        ACCEPT_LANGUAGES[idx]
    }

    /// Enforces the delay gate: blocks until `min_delay`/`max_delay` (or a
    /// random point between them) has elapsed since the last request issued
    /// by this session, per spec.md §4.2.
    async fn apply_delay_gate(&self) {
        let delay = if self.random_delay {
            let min = self.min_delay.as_secs_f64();
            let max = self.max_delay.as_secs_f64();
            let secs = if max > min { rand::thread_rng().gen_range(min..max) } else { min };
            Duration::from_secs_f64(secs)
        } else {
            self.min_delay
        };

        let mut last = self.last_request_time.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn get(&self, url: &str, config: &FetchConfig) -> Result<FetchResponse, CrawlError> {
        self.request(reqwest::Method::GET, url, config).await
    }

    pub async fn post(&self, url: &str, config: &FetchConfig) -> Result<FetchResponse, CrawlError> {
        self.request(reqwest::Method::POST, url, config).await
    }

    pub async fn head(&self, url: &str, config: &FetchConfig) -> Result<FetchResponse, CrawlError> {
        self.request(reqwest::Method::HEAD, url, config).await
    }

    /// Content-Type obtained via a HEAD request, used by the URL Analyzer's
    /// `deep` classification and the Downloader's extension derivation.
    pub async fn head_content_type(&self, url: &str) -> Result<Option<String>, CrawlError> {
        let resp = self.head(url, &FetchConfig::default()).await?;
        Ok(resp.content_type)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        config: &FetchConfig,
    ) -> Result<FetchResponse, CrawlError> {
        let mut attempt = 0u32;
        loop {
            self.apply_delay_gate().await;
            match self.try_once(method.clone(), url, config).await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(url, attempt, error = %e, "request failed, retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_once(
        &self,
        method: reqwest::Method,
        url: &str,
        config: &FetchConfig,
    ) -> Result<FetchResponse, CrawlError> {
        let start = Instant::now();
        let referer = Url::parse(url)
            .ok()
            .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or_default()));

        let mut builder = self
            .next_client()
            .request(method, url)
            .timeout(config.timeout)
            .header("User-Agent", self.pick_user_agent())
            .header("Accept-Language", self.pick_accept_language())
            .header("DNT", "1");

        if let Some(referer) = referer {
            builder = builder.header("Referer", referer);
        }

        debug!(url, "dispatching request");
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CrawlError::Timeout(config.timeout.as_secs())
            } else {
                CrawlError::Network(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let mut headers = std::collections::HashMap::new();
        for (k, v) in resp.headers() {
            if let Ok(val) = v.to_str() {
                headers.insert(k.as_str().to_ascii_lowercase(), val.to_string());
            }
        }
        let content_type = headers.get("content-type").cloned();

        let body = resp.bytes().await.map_err(|e| CrawlError::Network(e.to_string()))?;
        if body.len() > config.max_body_size {
            return Err(CrawlError::BodyTooLarge { size: body.len(), max: config.max_body_size });
        }

        Ok(FetchResponse {
            url: url.to_string(),
            final_url,
            status,
            headers,
            body: body.to_vec(),
            content_type,
            fetched_at: chrono::Utc::now(),
            response_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn is_retryable(err: &CrawlError) -> bool {
    // DNS/TLS/429/5xx are all treated as the same "network class" retry
    // bucket per spec.md §4.2/§7; only explicit client errors on the
    // response (handled by callers inspecting `status`) are not retried
    // here since they aren't surfaced as `CrawlError` at all.
    matches!(err, CrawlError::Network(_) | CrawlError::Timeout(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delay_gate_enforces_minimum_spacing() {
        let config = AntiScrapingConfig {
            use_random_user_agent: false,
            use_proxy: false,
            proxy_list: vec![],
            random_delay: false,
            min_delay: 0.05,
            max_delay: 0.05,
            max_retries: 0,
        };
        let transport = SessionTransport::new(&config).unwrap();
        let t0 = Instant::now();
        transport.apply_delay_gate().await;
        transport.apply_delay_gate().await;
        assert!(t0.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn proxy_pool_round_robins_across_clients() {
        let config = AntiScrapingConfig {
            use_random_user_agent: false,
            use_proxy: true,
            proxy_list: vec!["http://p1:8080".into(), "http://p2:8080".into()],
            random_delay: false,
            min_delay: 0.0,
            max_delay: 0.0,
            max_retries: 0,
        };
        let transport = SessionTransport::new(&config).unwrap();
        assert_eq!(transport.clients.len(), 2);
        let first = transport.client_counter.load(Ordering::Relaxed);
        let _ = transport.next_client();
        let _ = transport.next_client();
        let _ = transport.next_client();
        assert_eq!(transport.client_counter.load(Ordering::Relaxed), first + 3);
    }
}
