use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use peer_link::ReceivedFile;
use signal_proto::FileMetadata;

const FALLBACK_NAME: &str = "received.bin";
const DEFAULT_MIME: &str = "application/octet-stream";

/// Best-effort MIME type from the file extension.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt" | "md" | "log") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => DEFAULT_MIME,
    }
}

/// Reads `path` into memory along with the metadata announced at `file-start`.
pub async fn load(path: &Path, mime: Option<String>) -> Result<(FileMetadata, Bytes)> {
    let payload = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(FALLBACK_NAME)
        .to_string();
    let metadata = FileMetadata {
        name,
        size: payload.len() as u64,
        mime_type: mime.unwrap_or_else(|| guess_mime(path).to_string()),
    };
    Ok((metadata, Bytes::from(payload)))
}

/// Strips directory components a remote peer may have put in the name.
fn safe_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        FALLBACK_NAME.to_string()
    } else {
        base.to_string()
    }
}

/// First free path for `name` under `dir`, suffixing ` (n)` before the extension.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name);
    let ext = path.extension().and_then(|ext| ext.to_str());
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

pub async fn save(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = unique_path(dir, &safe_name(&file.metadata.name));
    tokio::fs::write(&path, &file.payload)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
