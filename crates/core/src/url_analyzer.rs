use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use url::Url;

/// File extensions recognized as images by suffix. See spec.md §4.1.
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "svg", "ico",
];

/// Path patterns that indicate a dynamically-served image even without a
/// recognizable extension, per spec.md §4.1.
static DYNAMIC_IMAGE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)/getCroppingImg/",
        r"(?i)/getImage/",
        r"(?i)/api/.*/(image|photo)/",
        r"(?i)/v\d+/image/",
    ])
    .expect("static dynamic-image patterns must compile")
});

static DYNAMIC_IMAGE_HOSTS: &[&str] = &["images.unsplash.com", "cdn.jsdelivr.net", "i.imgur.com"];

/// URL patterns that should never be classified as images even if they
/// otherwise look dynamic, per spec.md §4.1.
static NON_IMAGE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\.(css|js|pdf|zip|mp4|mp3|avi|mov|doc|docx|xls|xlsx)(\?|$)",
        r"(?i)/ads/",
        r"(?i)thumbnail|favicon",
    ])
    .expect("static non-image patterns must compile")
});

static BACKGROUND_IMAGE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"background-image\s*:\s*url\((['"]?)([^'")]+)\1\)"#).expect("valid regex"));

pub fn background_image_url_regex() -> &'static Regex {
    &BACKGROUND_IMAGE_URL
}

/// Lowercases host, strips the default port for the scheme, drops the
/// fragment, and forces a scheme (defaulting to https) when missing.
/// Idempotent: `normalize(normalize(u)) == normalize(u)`.
pub fn normalize(raw: &str) -> String {
    let with_scheme = ensure_scheme(raw);
    let Ok(mut parsed) = Url::parse(&with_scheme) else {
        return with_scheme;
    };

    if let Some(host) = parsed.host_str() {
        let lower = host.to_ascii_lowercase();
        let _ = parsed.set_host(Some(&lower));
    }

    let default_port = match parsed.scheme() {
        "https" => Some(443),
        "http" => Some(80),
        _ => None,
    };
    if parsed.port() == default_port {
        let _ = parsed.set_port(None);
    }

    parsed.set_fragment(None);
    parsed.to_string()
}

fn ensure_scheme(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("//") {
        return format!("https:{}", trimmed);
    }
    if trimmed.contains("://") {
        return trimmed.to_string();
    }
    format!("https://{}", trimmed)
}

/// Resolves a relative, protocol-relative, or absolute URL against `base`.
pub fn to_absolute(base: &str, url: &str) -> Option<String> {
    let base_url = Url::parse(&ensure_scheme(base)).ok()?;
    if let Some(stripped) = url.strip_prefix("//") {
        let resolved = format!("{}:{}", base_url.scheme(), stripped);
        return Url::parse(&resolved).ok().map(|u| u.to_string());
    }
    if url.contains("://") {
        return Url::parse(url).ok().map(|u| u.to_string());
    }
    base_url.join(url).ok().map(|u| u.to_string())
}

/// Classifies a URL as an image. When `deep` is set, callers MAY perform a
/// HEAD request themselves (the analyzer only flags the candidate here —
/// the actual network probe lives in the Session Transport / Downloader so
/// this module stays free of I/O, per spec.md §4.1's "MAY perform a HEAD
/// request").
pub fn is_image(url: &str, deep: bool) -> bool {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("data:") || lower.starts_with("javascript:") || lower.starts_with("mailto:") || lower.starts_with("tel:") {
        return false;
    }
    if NON_IMAGE_PATTERNS.is_match(&lower) {
        return false;
    }

    if let Some(ext) = extension_of(&lower) {
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return true;
        }
    }

    if DYNAMIC_IMAGE_PATTERNS.is_match(url) {
        return true;
    }

    if let Ok(parsed) = Url::parse(&ensure_scheme(url)) {
        if let Some(host) = parsed.host_str() {
            if DYNAMIC_IMAGE_HOSTS.contains(&host) {
                return true;
            }
        }
    }

    // `deep` is a policy flag consumed by the I/O layer; a pure classifier
    // can't perform the HEAD request itself, so it only affects callers that
    // choose to escalate a "maybe dynamic image" candidate.
    let _ = deep;
    false
}

/// A URL is a "potential dynamic image" worth a HEAD-request escalation when
/// `deep=true` if it isn't already classified as an image by suffix/pattern
/// but also isn't excluded by the non-image patterns.
pub fn is_potential_dynamic_image(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    if NON_IMAGE_PATTERNS.is_match(&lower) {
        return false;
    }
    extension_of(&lower).is_none()
}

fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    last_segment.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
}

/// True if `url` and the analyzer's configured base resolve to the same
/// registrable host.
pub fn is_same_origin(base: &str, url: &str) -> bool {
    let base_host = Url::parse(&ensure_scheme(base)).ok().and_then(|u| u.host_str().map(str::to_string));
    let target_host = Url::parse(&ensure_scheme(url)).ok().and_then(|u| u.host_str().map(str::to_string));
    match (base_host, target_host) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
        _ => false,
    }
}

/// Derives a filename for a downloaded image. Uses the URL's basename when
/// parseable and extension-bearing, otherwise falls back to
/// `image_<first-8-hex-of-md5(url)>.jpg` per spec.md §4.1.
pub fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = Url::parse(&ensure_scheme(url)) {
        if let Some(segments) = parsed.path_segments() {
            if let Some(last) = segments.last() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    let digest = md5::compute(url.as_bytes());
    let hex = format!("{:x}", digest);
    format!("image_{}.jpg", &hex[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "HTTP://Example.COM:80/path#frag",
            "https://example.com/a/b/",
            "example.com/no-scheme",
        ];
        for u in inputs {
            let once = normalize(u);
            let twice = normalize(&once);
            assert_eq!(once, twice, "normalize should be idempotent for {u}");
        }
    }

    #[test]
    fn normalize_strips_default_port_and_fragment() {
        assert_eq!(normalize("http://Example.com:80/x#y"), "http://example.com/x");
        assert_eq!(normalize("https://Example.com:443/x#y"), "https://example.com/x");
    }

    #[test]
    fn normalize_defaults_missing_scheme_to_https() {
        assert!(normalize("example.com/img.jpg").starts_with("https://"));
    }

    #[test]
    fn to_absolute_commutes_with_normalize() {
        let base = "https://example.com/gallery/";
        for u in ["../img.jpg", "/img.jpg", "https://cdn.example.com/x.png", "//cdn.example.com/y.png"] {
            let direct = to_absolute(base, u).unwrap();
            let via_normalized = to_absolute(base, &normalize(u)).unwrap();
            // normalize() may rewrite the host case/port, but both must
            // resolve to a same-host absolute URL.
            assert_eq!(
                Url::parse(&direct).unwrap().host_str(),
                Url::parse(&via_normalized).unwrap().host_str(),
            );
        }
    }

    #[test]
    fn is_image_recognizes_known_suffixes() {
        for ext in ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "svg", "ico"] {
            let u = format!("https://cdn.example.com/x.{ext}");
            assert!(is_image(&u, false), "{u} should classify as image");
        }
    }

    #[test]
    fn is_image_recognizes_dynamic_patterns() {
        assert!(is_image(
            "https://haowallpaper.com/link/common/file/getCroppingImg/17044056264658304",
            false
        ));
        assert!(is_image("https://site.example/api/v1/photo/123", false));
        assert!(is_image("https://site.example/v2/image/abc", false));
    }

    #[test]
    fn is_image_excludes_known_non_image_patterns() {
        assert!(!is_image("https://example.com/app.js", false));
        assert!(!is_image("https://example.com/ads/banner.jpg", false));
        assert!(!is_image("https://example.com/favicon.ico", false));
        assert!(!is_image("data:image/png;base64,AAAA", false));
        assert!(!is_image("javascript:void(0)", false));
    }

    #[test]
    fn is_same_origin_matches_host_case_insensitively() {
        assert!(is_same_origin("https://Example.com", "https://example.com/x"));
        assert!(!is_same_origin("https://example.com", "https://other.com/x"));
    }

    #[test]
    fn extract_filename_uses_basename_when_present() {
        assert_eq!(extract_filename("https://cdn.example.com/a/b/photo.jpg"), "photo.jpg");
    }

    #[test]
    fn extract_filename_falls_back_to_md5_hash() {
        let name = extract_filename("https://haowallpaper.com/link/common/file/getCroppingImg/17044056264658304");
        assert!(name.starts_with("image_"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), "image_".len() + 8 + ".jpg".len());
    }
}
