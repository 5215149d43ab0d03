//! On-disk JSON documents for the file-backed incident repository.
//!
//! Every document is written to a `.tmp` sibling and renamed into place, so a
//! crash mid-write leaves either the old document or the new one, never a mix.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};

const DOCUMENT_EXT: &str = "json";

/// Path of the document stored under `key` in `dir`.
///
/// Keys are incident ids; anything outside `[A-Za-z0-9_-]` is replaced so a
/// key can never escape the directory.
pub fn document_path(dir: &Path, key: &str) -> PathBuf {
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{safe}.{DOCUMENT_EXT}"))
}

/// Serialize `data` as pretty JSON and atomically replace `path`.
pub async fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Read and deserialize a document. `Ok(None)` when it does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Delete a document. Returns whether anything was removed.
pub async fn remove_document(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// All document paths in `dir`, sorted. A missing directory is empty.
pub async fn list_documents(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(DOCUMENT_EXT) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
