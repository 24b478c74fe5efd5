use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use icrawl_core::url_analyzer;

/// `<img>` lazy-load attributes, in priority order, checked before falling
/// back to `srcset` candidates and finally plain `src`. Per spec.md §4.4.
const IMG_LAZY_ATTRS: &[&str] = &[
    "data-original",
    "data-src",
    "data-lazy-src",
    "data-lazy",
    "data-url",
    "data-img",
    "data-image",
    "data-large",
    "data-full",
    "data-hd",
    "data-hi-res",
    "data-zoom",
    "data-thumb",
    "data-preview",
];

/// Skip patterns for link discovery: scheme prefixes that are never
/// crawlable and document-download extensions, per spec.md §4.4.
static SKIP_HREF_PREFIXES: &[&str] = &["javascript:", "mailto:", "tel:", "#"];

static DOWNLOAD_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.(pdf|zip|rar|7z|tar|gz|exe|dmg|doc|docx|xls|xlsx|ppt|pptx)(\?|$)")
        .expect("valid regex")
});

pub struct ParsedPage {
    pub title: Option<String>,
    pub images: Vec<String>,
    pub links: Vec<String>,
}

/// Walks the DOM per spec.md §4.4: image discovery across `<img>` lazy-load
/// attributes, `srcset`, `<div|span|a data-original>`, inline
/// `background-image: url(...)`, and `<picture><source srcset>`; link
/// discovery across same-origin `<a href>`.
pub fn parse_document(body: &str, base_url: &str) -> ParsedPage {
    let document = Html::parse_document(body);

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let mut images = Vec::new();
    collect_img_images(&document, base_url, &mut images);
    collect_attribute_bearing_images(&document, base_url, &mut images);
    collect_background_images(&document, base_url, &mut images);
    collect_picture_source_images(&document, base_url, &mut images);
    dedup_in_place(&mut images);

    let links = collect_links(&document, base_url);

    ParsedPage { title, images, links }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

fn push_if_image(base_url: &str, candidate: &str, out: &mut Vec<String>) {
    let Some(absolute) = url_analyzer::to_absolute(base_url, candidate.trim()) else {
        return;
    };
    if url_analyzer::is_image(&absolute, false) {
        out.push(absolute);
    }
}

/// Picks the first candidate from the first non-empty source in the
/// attribute priority list: lazy-load attributes, then `srcset` (each
/// candidate URL, stripping the descriptor), then plain `src` last.
fn collect_img_images(document: &Html, base_url: &str, out: &mut Vec<String>) {
    let Some(sel) = selector("img") else { return };
    for el in document.select(&sel) {
        let value = el.value();
        let mut found = false;
        for attr in IMG_LAZY_ATTRS {
            if let Some(v) = value.attr(attr) {
                if !v.trim().is_empty() {
                    push_if_image(base_url, v, out);
                    found = true;
                    break;
                }
            }
        }
        if found {
            continue;
        }
        if let Some(srcset) = value.attr("srcset") {
            for candidate in parse_srcset(srcset) {
                push_if_image(base_url, &candidate, out);
                found = true;
            }
        }
        if found {
            continue;
        }
        if let Some(src) = value.attr("src") {
            push_if_image(base_url, src, out);
        }
    }
}

/// `srcset="a.jpg 1x, b.jpg 2x"` -> `["a.jpg", "b.jpg"]`.
fn parse_srcset(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.trim().split_whitespace().next())
        .map(|url| url.to_string())
        .collect()
}

/// `<div|span|a data-original="...">` bearing elements, per spec.md §4.4.
fn collect_attribute_bearing_images(document: &Html, base_url: &str, out: &mut Vec<String>) {
    let Some(sel) = selector("div[data-original], span[data-original], a[data-original]") else {
        return;
    };
    for el in document.select(&sel) {
        if let Some(v) = el.value().attr("data-original") {
            push_if_image(base_url, v, out);
        }
    }
}

/// Any element with an inline `style` containing `background-image: url(...)`.
fn collect_background_images(document: &Html, base_url: &str, out: &mut Vec<String>) {
    let Some(sel) = selector("[style*='background-image']") else {
        return;
    };
    let bg_re = url_analyzer::background_image_url_regex();
    for el in document.select(&sel) {
        if let Some(style) = el.value().attr("style") {
            for cap in bg_re.captures_iter(style) {
                push_if_image(base_url, &cap[2], out);
            }
        }
    }
}

/// `<picture><source srcset=...>` candidates.
fn collect_picture_source_images(document: &Html, base_url: &str, out: &mut Vec<String>) {
    let Some(sel) = selector("picture source[srcset]") else {
        return;
    };
    for el in document.select(&sel) {
        if let Some(srcset) = el.value().attr("srcset") {
            for candidate in parse_srcset(srcset) {
                push_if_image(base_url, &candidate, out);
            }
        }
    }
}

/// All `<a href>` whose absolute form is same-origin, not a document
/// download, and not an anchor/`javascript:`/`mailto:`/`tel:` link.
fn collect_links(document: &Html, base_url: &str) -> Vec<String> {
    let Some(sel) = selector("a[href]") else { return vec![] };
    let mut links = Vec::new();
    for el in document.select(&sel) {
        let Some(href) = el.value().attr("href") else { continue };
        let trimmed = href.trim();
        if trimmed.is_empty() || SKIP_HREF_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            continue;
        }
        let Some(absolute) = url_analyzer::to_absolute(base_url, trimmed) else { continue };
        if DOWNLOAD_EXTENSION.is_match(&absolute) {
            continue;
        }
        if !url_analyzer::is_same_origin(base_url, &absolute) {
            continue;
        }
        links.push(absolute);
    }
    dedup_in_place(&mut links);
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://gallery.example.com/page";

    #[test]
    fn img_lazy_attribute_takes_priority_over_src() {
        let html = r#"<img data-original="https://gallery.example.com/full.jpg" src="https://gallery.example.com/thumb_small.png">"#;
        let page = parse_document(html, BASE);
        assert_eq!(page.images, vec!["https://gallery.example.com/full.jpg"]);
    }

    #[test]
    fn img_falls_back_to_srcset_then_src() {
        let html = r#"<img srcset="https://gallery.example.com/a.jpg 1x, https://gallery.example.com/b.jpg 2x">"#;
        let page = parse_document(html, BASE);
        assert_eq!(
            page.images,
            vec![
                "https://gallery.example.com/a.jpg".to_string(),
                "https://gallery.example.com/b.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn img_plain_src_used_when_nothing_else_present() {
        let html = r#"<img src="https://gallery.example.com/plain.gif">"#;
        let page = parse_document(html, BASE);
        assert_eq!(page.images, vec!["https://gallery.example.com/plain.gif"]);
    }

    #[test]
    fn data_original_on_div_is_discovered() {
        let html = r#"<div data-original="https://gallery.example.com/bg.webp"></div>"#;
        let page = parse_document(html, BASE);
        assert_eq!(page.images, vec!["https://gallery.example.com/bg.webp"]);
    }

    #[test]
    fn inline_background_image_is_discovered() {
        let html = r#"<div style="background-image: url('https://gallery.example.com/bg2.png')"></div>"#;
        let page = parse_document(html, BASE);
        assert_eq!(page.images, vec!["https://gallery.example.com/bg2.png"]);
    }

    #[test]
    fn picture_source_srcset_is_discovered() {
        let html = r#"<picture><source srcset="https://gallery.example.com/c.webp"><img src="https://gallery.example.com/c.jpg"></picture>"#;
        let page = parse_document(html, BASE);
        assert!(page.images.contains(&"https://gallery.example.com/c.webp".to_string()));
        assert!(page.images.contains(&"https://gallery.example.com/c.jpg".to_string()));
    }

    #[test]
    fn links_are_filtered_by_origin_and_skip_patterns() {
        let html = r#"
            <a href="/same-origin-page">ok</a>
            <a href="https://other.example.com/x">external</a>
            <a href="javascript:void(0)">js</a>
            <a href="mailto:a@example.com">mail</a>
            <a href="/file.pdf">doc</a>
            <a href="#top">anchor</a>
        "#;
        let page = parse_document(html, BASE);
        assert_eq!(page.links, vec!["https://gallery.example.com/same-origin-page".to_string()]);
    }

    #[test]
    fn title_is_trimmed() {
        let html = "<title>  Gallery Home  </title>";
        let page = parse_document(html, BASE);
        assert_eq!(page.title.as_deref(), Some("Gallery Home"));
    }
}
