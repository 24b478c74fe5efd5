pub mod encoding;
pub mod html;

use icrawl_core::FetchResponse;
use sha2::{Digest, Sha256};

pub use html::ParsedPage;

/// Max bytes handed to the DOM parser; larger pages are truncated first, per
/// spec.md §4.4's "CPU-bound step" budget discussion in §4.5.
const MAX_PARSE_SIZE: usize = 5 * 1024 * 1024;

/// Result of parsing a fetched page: discovered images/links plus the hash
/// used for the `raw_html_hash` style bookkeeping the storage layer keeps.
pub struct PageParseResult {
    pub title: Option<String>,
    pub images: Vec<String>,
    pub links: Vec<String>,
    pub body_hash: String,
}

/// Decodes `resp.body` with the auto-detected encoding and walks the DOM for
/// images and same-origin links. This is the CPU-bound step spec.md §4.5
/// offloads to a worker thread via `tokio::task::spawn_blocking`.
pub fn parse_response(resp: &FetchResponse) -> PageParseResult {
    let body = if resp.body.len() > MAX_PARSE_SIZE {
        &resp.body[..MAX_PARSE_SIZE]
    } else {
        &resp.body[..]
    };

    let text = encoding::decode_body(body, resp.content_type.as_deref());
    let page = html::parse_document(&text, &resp.final_url);

    let mut hasher = Sha256::new();
    hasher.update(&resp.body);
    let body_hash = format!("{:x}", hasher.finalize());

    PageParseResult {
        title: page.title,
        images: page.images,
        links: page.links,
        body_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn parse_response_truncates_oversized_bodies_without_panicking() {
        let body = vec![b'a'; MAX_PARSE_SIZE + 1024];
        let resp = FetchResponse {
            url: "https://example.com".into(),
            final_url: "https://example.com".into(),
            status: 200,
            headers: HashMap::new(),
            body,
            content_type: Some("text/html; charset=utf-8".into()),
            fetched_at: Utc::now(),
            response_time_ms: 1,
        };
        let result = parse_response(&resp);
        assert!(result.images.is_empty());
        assert!(!result.body_hash.is_empty());
    }
}
