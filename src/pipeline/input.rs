// Input resolution: files, directories and http(s) URLs.
//
// URLs are downloaded into a temp file that is removed when the returned
// guard drops, so a failed scan never leaves downloads behind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Url};
use tracing::debug;

pub const MAX_DOWNLOAD_BYTES: usize = 25_000_000;
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp", "tif", "tiff"];

pub fn is_url(input: &str) -> bool {
    Url::parse(input)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand one CLI input into the list of things to scan, sorted.
///
/// URLs and plain files pass through untouched; directories yield their
/// image files (recursively when asked).
pub fn collect_inputs(input: &str, recursive: bool) -> Result<Vec<String>> {
    if is_url(input) {
        return Ok(vec![input.to_string()]);
    }
    let root = Path::new(input);
    if !root.is_dir() {
        return Ok(vec![input.to_string()]);
    }

    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if path.is_file() && is_image_file(&path) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out.into_iter().map(|p| p.display().to_string()).collect())
}

/// Extension and MIME type from magic bytes.
pub fn sniff_image(data: &[u8]) -> Option<(&'static str, &'static str)> {
    if data.starts_with(b"\xff\xd8\xff") {
        Some(("jpg", "image/jpeg"))
    } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(("png", "image/png"))
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some(("gif", "image/gif"))
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some(("webp", "image/webp"))
    } else {
        None
    }
}

/// Pick the temp-file extension for a download.
fn choose_extension(url: &Url, content_type: &str, data: &[u8]) -> Result<&'static str> {
    let sniffed = sniff_image(data);
    let mut ctype = content_type.to_string();
    if !ctype.is_empty() && !ctype.starts_with("image/") {
        match sniffed {
            Some((_, mime)) => ctype = mime.to_string(),
            None => bail!("URL did not return an image (content-type={content_type})"),
        }
    }
    if ctype.is_empty() {
        if let Some((_, mime)) = sniffed {
            ctype = mime.to_string();
        }
    }

    Ok(match ctype.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => {
            let path_ext = Path::new(url.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            match path_ext.as_deref() {
                Some("jpg" | "jpeg") => "jpg",
                Some("png") => "png",
                Some("webp") => "webp",
                Some("gif") => "gif",
                _ => match sniffed {
                    Some((ext, _)) => ext,
                    None => bail!("URL does not look like a supported image format (jpeg/png/webp/gif)"),
                },
            }
        }
    })
}

/// A downloaded input; the file is deleted on drop.
#[derive(Debug)]
pub struct TempInput {
    pub path: PathBuf,
    pub display_name: String,
}

impl Drop for TempInput {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Temp download already gone");
        }
    }
}

pub async fn download_to_temp(client: &Client, url: &str) -> Result<TempInput> {
    let parsed = Url::parse(url).with_context(|| format!("invalid URL {url}"))?;
    let mut response = client
        .get(parsed.clone())
        .header(USER_AGENT, concat!("modgate/", env!("CARGO_PKG_VERSION")))
        .header(ACCEPT, "image/*,*/*;q=0.8")
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("failed to fetch {url}"))?;

    let declared = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(len) = declared {
        if len > MAX_DOWNLOAD_BYTES {
            bail!("URL too large: {len} bytes (limit {MAX_DOWNLOAD_BYTES})");
        }
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let mut data = Vec::new();
    while let Some(chunk) = response.chunk().await.context("download interrupted")? {
        data.extend_from_slice(&chunk);
        if data.len() > MAX_DOWNLOAD_BYTES {
            bail!("URL too large: downloaded > {MAX_DOWNLOAD_BYTES} bytes");
        }
    }

    let ext = choose_extension(&parsed, &content_type, &data)?;
    let display_name = Path::new(parsed.path())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("downloaded.{ext}"));

    let path = std::env::temp_dir().join(format!("modgate-dl-{:016x}.{ext}", rand::random::<u64>()));
    tokio::fs::write(&path, &data)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!(url, bytes = data.len(), path = %path.display(), "Downloaded input");

    Ok(TempInput { path, display_name })
}
