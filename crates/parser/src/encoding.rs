use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::Regex;

/// Common encodings tried, in order, when no declared charset decodes
/// cleanly. Mirrors spec.md §4.4's fallback list.
const FALLBACK_ENCODINGS: &[&str] = &["utf-8", "gbk", "gb2312", "big5", "iso-8859-1", "windows-1252"];

/// How much of the body is scanned for `<meta charset>` / XML `encoding=`
/// declarations before falling through to statistical detection.
const META_SCAN_WINDOW: usize = 2048;

static CONTENT_TYPE_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)charset\s*=\s*"?'?([a-zA-Z0-9_\-]+)"?'?"#).expect("valid regex"));

static META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([a-zA-Z0-9_\-]+)"#).expect("valid regex")
});

static XML_ENCODING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<\?xml[^>]+encoding\s*=\s*["']([a-zA-Z0-9_\-]+)"#).expect("valid regex"));

/// Decodes an HTTP body to a `String`, auto-detecting its encoding per
/// spec.md §4.4: declared charset (header, then BOM, then in-document
/// declarations), then a byte-signature heuristic for GBK, then a plain
/// UTF-8 attempt, then a statistical guess, then the common-encodings list,
/// and finally UTF-8 with invalid sequences dropped.
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    if let Some(label) = content_type.and_then(|ct| CONTENT_TYPE_CHARSET.captures(ct)) {
        if let Some(enc) = Encoding::for_label(label[1].as_bytes()) {
            if let Some(text) = try_decode_strict(enc, body) {
                return text;
            }
        }
    }

    if let Some((enc, bom_len)) = Encoding::for_bom(body) {
        let (text, _, had_errors) = enc.decode(&body[bom_len..]);
        if !had_errors {
            return text.into_owned();
        }
    }

    let scan_len = body.len().min(META_SCAN_WINDOW);
    let ascii_prefix = String::from_utf8_lossy(&body[..scan_len]);
    if let Some(label) = META_CHARSET
        .captures(&ascii_prefix)
        .or_else(|| XML_ENCODING.captures(&ascii_prefix))
    {
        if let Some(enc) = Encoding::for_label(label[1].as_bytes()) {
            if let Some(text) = try_decode_strict(enc, body) {
                return text;
            }
        }
    }

    if looks_like_gbk(body) {
        if let Some(text) = try_decode_strict(encoding_rs::GBK, body) {
            return text;
        }
    }

    if let Ok(text) = std::str::from_utf8(body) {
        return text.to_string();
    }

    if let Some(text) = guess_with_confidence(body) {
        return text;
    }

    for label in FALLBACK_ENCODINGS {
        if let Some(enc) = Encoding::for_label(label.as_bytes()) {
            if let Some(text) = try_decode_strict(enc, body) {
                return text;
            }
        }
    }

    String::from_utf8_lossy(body).into_owned()
}

fn try_decode_strict(enc: &'static Encoding, body: &[u8]) -> Option<String> {
    let (text, _, had_errors) = enc.decode(body);
    if had_errors {
        None
    } else {
        Some(text.into_owned())
    }
}

/// Cheap lead/trail byte-pair heuristic for GBK: a GBK lead byte is
/// 0x81-0xFE followed by a trail byte outside the ASCII range. A body with a
/// sizeable share of such pairs is very unlikely to be anything else.
fn looks_like_gbk(body: &[u8]) -> bool {
    let sample = &body[..body.len().min(8192)];
    let mut pairs = 0usize;
    let mut candidates = 0usize;
    let mut i = 0;
    while i + 1 < sample.len() {
        let lead = sample[i];
        if (0x81..=0xFE).contains(&lead) {
            candidates += 1;
            let trail = sample[i + 1];
            if (0x40..=0xFE).contains(&trail) && trail != 0x7F {
                pairs += 1;
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    candidates >= 8 && pairs * 10 >= candidates * 9
}

/// Uses `chardetng`'s statistical detector and accepts its guess only when
/// decoding the full body through it produces a replacement-character ratio
/// under 0.3% (the closest proxy to the spec's "confidence ≥ 0.7" threshold
/// a non-probabilistic detector can offer).
fn guess_with_confidence(body: &[u8]) -> Option<String> {
    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(body, true);
    let guessed = detector.guess(None, true);
    let (text, _, _) = guessed.decode(body);
    let replacements = text.matches('\u{FFFD}').count();
    let confidence = 1.0 - (replacements as f64 / text.chars().count().max(1) as f64);
    if confidence >= 0.7 {
        Some(text.into_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_utf8() {
        let body = "héllo wörld".as_bytes();
        assert_eq!(decode_body(body, None), "héllo wörld");
    }

    #[test]
    fn honors_content_type_charset_header() {
        let (encoded, _, _) = encoding_rs::WINDOWS_1252.encode("café");
        let decoded = decode_body(&encoded, Some("text/html; charset=windows-1252"));
        assert_eq!(decoded, "café");
    }

    #[test]
    fn honors_meta_charset_declaration() {
        let html = r#"<html><head><meta charset="gb2312"></head><body>ok</body></html>"#;
        let (encoded, _, had_errors) = encoding_rs::GB18030.encode(html);
        assert!(!had_errors);
        let decoded = decode_body(&encoded, None);
        assert!(decoded.contains("ok"));
    }

    #[test]
    fn falls_back_to_utf8_lossy_on_garbage() {
        let body = [0xFF, 0xFE, 0xFD, 0x00, 0x41];
        let decoded = decode_body(&body, None);
        assert!(decoded.contains('A') || !decoded.is_empty());
    }
}
