use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use icrawl_core::url_analyzer;
use icrawl_core::FetchConfig;
use icrawl_transport::SessionTransport;
use tracing::{debug, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Minimum accepted payload size, per spec.md §4.3.
const MIN_BYTES: usize = 100;
/// Minimum accepted pixel dimension (both width and height), per spec.md §4.3.
const MIN_DIMENSION: u32 = 10;

/// Structured result of a download attempt, per spec.md §4.3's
/// `{success, local_path, file_size, width, height, format, md5_hash,
/// download_time, error?}`.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub success: bool,
    pub local_path: Option<String>,
    pub file_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub md5_hash: Option<String>,
    pub download_time_ms: u64,
    pub error: Option<String>,
}

impl DownloadOutcome {
    fn failure(error: String, download_time_ms: u64) -> Self {
        Self {
            success: false,
            local_path: None,
            file_size: None,
            width: None,
            height: None,
            format: None,
            md5_hash: None,
            download_time_ms,
            error: Some(error),
        }
    }
}

/// Downloads `url` into `download_dir`, validating the result as a decodable
/// raster image before treating it as a success. Implements spec.md §4.3.
pub async fn download(
    transport: &SessionTransport,
    url: &str,
    filename: Option<String>,
    max_retries: u32,
    timeout: Duration,
    download_dir: &Path,
) -> DownloadOutcome {
    let start = Instant::now();
    let filename = match filename {
        Some(f) => f,
        None => resolve_filename(transport, url).await,
    };

    let final_path = download_dir.join(&filename);
    if final_path.exists() {
        if let Some(existing) = validate_existing(&final_path) {
            debug!(url, path = %final_path.display(), "file already present, skipping download");
            return DownloadOutcome {
                download_time_ms: start.elapsed().as_millis() as u64,
                ..existing
            };
        }
    }

    let mut attempt = 0u32;
    loop {
        match try_download_once(transport, url, &filename, timeout, download_dir).await {
            Ok(outcome) => {
                return DownloadOutcome { download_time_ms: start.elapsed().as_millis() as u64, ..outcome }
            }
            Err(e) if attempt < max_retries => {
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                warn!(url, attempt, error = %e, "download attempt failed, retrying after backoff");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                let msg = format!("{e} (after {} attempts)", attempt + 1);
                return DownloadOutcome::failure(msg, start.elapsed().as_millis() as u64);
            }
        }
    }
}

async fn resolve_filename(transport: &SessionTransport, url: &str) -> String {
    let candidate = url_analyzer::extract_filename(url);
    if has_known_image_extension(&candidate) {
        return candidate;
    }

    let extension = transport
        .head_content_type(url)
        .await
        .ok()
        .flatten()
        .and_then(|ct| extension_for_content_type(&ct))
        .unwrap_or_else(|| "jpg".to_string());

    match candidate.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.{extension}"),
        None => format!("{candidate}.{extension}"),
    }
}

fn has_known_image_extension(filename: &str) -> bool {
    const KNOWN: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "tiff", "tif"];
    filename
        .rsplit_once('.')
        .map(|(_, ext)| KNOWN.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn extension_for_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next().unwrap_or(content_type).trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        "image/tiff" => "tiff",
        _ => return None,
    };
    Some(ext.to_string())
}

async fn try_download_once(
    transport: &SessionTransport,
    url: &str,
    filename: &str,
    timeout: Duration,
    download_dir: &Path,
) -> Result<DownloadOutcome, String> {
    let config = FetchConfig { timeout, ..FetchConfig::default() };
    let resp = transport.get(url, &config).await.map_err(|e| e.to_string())?;
    if resp.status != 200 {
        return Err(format!("non-200 status {}", resp.status));
    }

    tokio::fs::create_dir_all(download_dir).await.map_err(|e| e.to_string())?;
    let temp_path = temp_path_for(download_dir, filename);
    tokio::fs::write(&temp_path, &resp.body).await.map_err(|e| e.to_string())?;

    match validate_bytes(&resp.body) {
        Ok((width, height, format)) => {
            let final_path = download_dir.join(filename);
            tokio::fs::rename(&temp_path, &final_path).await.map_err(|e| e.to_string())?;
            let md5_hash = format!("{:x}", md5::compute(&resp.body));
            Ok(DownloadOutcome {
                success: true,
                local_path: Some(final_path.to_string_lossy().into_owned()),
                file_size: Some(resp.body.len() as u64),
                width: Some(width),
                height: Some(height),
                format: Some(format),
                md5_hash: Some(md5_hash),
                download_time_ms: 0,
                error: None,
            })
        }
        Err(reason) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(reason)
        }
    }
}

fn temp_path_for(download_dir: &Path, filename: &str) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    download_dir.join(format!("{filename}.part{n}"))
}

/// Validates raw bytes per spec.md §4.3: non-empty, `>= MIN_BYTES`, decodable
/// as a raster image, both dimensions `>= MIN_DIMENSION`.
fn validate_bytes(bytes: &[u8]) -> Result<(u32, u32, String), String> {
    if bytes.len() < MIN_BYTES {
        return Err(format!("payload too small ({} bytes)", bytes.len()));
    }
    let reader = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| format!("could not detect image format: {e}"))?;
    let format = reader.format().map(|f| format!("{f:?}").to_ascii_lowercase());
    let img = reader.decode().map_err(|e| format!("not decodable as an image: {e}"))?;
    let (width, height) = (img.width(), img.height());
    if width < MIN_DIMENSION || height < MIN_DIMENSION {
        return Err(format!("image too small ({width}x{height})"));
    }
    Ok((width, height, format.unwrap_or_else(|| "unknown".to_string())))
}

fn validate_existing(path: &Path) -> Option<DownloadOutcome> {
    let bytes = std::fs::read(path).ok()?;
    let (width, height, format) = validate_bytes(&bytes).ok()?;
    Some(DownloadOutcome {
        success: true,
        local_path: Some(path.to_string_lossy().into_owned()),
        file_size: Some(bytes.len() as u64),
        width: Some(width),
        height: Some(height),
        format: Some(format),
        md5_hash: Some(format!("{:x}", md5::compute(&bytes))),
        download_time_ms: 0,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        // 16x16 1-bit PNG, well above MIN_BYTES and MIN_DIMENSION.
        let img = image::RgbImage::from_pixel(16, 16, image::Rgb([10, 20, 30]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn validate_bytes_accepts_well_formed_png() {
        let bytes = tiny_png();
        let (w, h, fmt) = validate_bytes(&bytes).unwrap();
        assert_eq!((w, h), (16, 16));
        assert_eq!(fmt, "png");
    }

    #[test]
    fn validate_bytes_rejects_too_small_payload() {
        let err = validate_bytes(&[1, 2, 3]).unwrap_err();
        assert!(err.contains("too small"));
    }

    #[test]
    fn validate_bytes_rejects_undersized_dimensions() {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([1, 1, 1]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img).write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let err = validate_bytes(buf.get_ref()).unwrap_err();
        assert!(err.contains("too small") || err.contains('x'));
    }

    #[test]
    fn extension_for_content_type_maps_known_mimes() {
        assert_eq!(extension_for_content_type("image/jpeg"), Some("jpg".to_string()));
        assert_eq!(extension_for_content_type("image/svg+xml; charset=utf-8"), Some("svg".to_string()));
        assert_eq!(extension_for_content_type("text/html"), None);
    }

    #[test]
    fn has_known_image_extension_checks_suffix() {
        assert!(has_known_image_extension("photo.JPG"));
        assert!(!has_known_image_extension("photo.php"));
        assert!(!has_known_image_extension("photo"));
    }

    #[tokio::test]
    async fn validate_existing_reads_and_revalidates_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("existing.png");
        tokio::fs::write(&path, tiny_png()).await.unwrap();
        let outcome = validate_existing(&path).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.width, Some(16));
    }
}
