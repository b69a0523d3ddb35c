//! Blob storage seam for the radiograph archive.
//!
//! The archive only speaks this trait; the production deployment binds it to
//! a cloud bucket client, the CLI and the test suite bind it to a local
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::{KneegradeError, Result};

/// Descriptor for one stored blob.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    /// Store-relative path, '/'-separated.
    pub name: String,
    /// Publicly resolvable URL for the blob.
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub content_type: Option<String>,
}

/// Minimal blob-store surface consumed by the archive.
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`, returning the blob's public URL.
    fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// Fetch a blob's bytes. Returns `BlobNotFound` when absent.
    fn download(&self, path: &str) -> Result<Vec<u8>>;

    /// Enumerate blobs whose path starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>>;

    fn exists(&self, path: &str) -> Result<bool>;
}

/// Filesystem-backed store rooted at a directory.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<LocalDirStore> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| KneegradeError::Storage(format!("{}: {e}", root.display())))?;
        Ok(LocalDirStore { root })
    }

    fn blob_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn url_for(&self, path: &str) -> String {
        format!("file://{}", self.blob_path(path).display())
    }

    fn collect_files(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_files(&path, out)?;
            } else if path.is_file() {
                out.push(path);
            }
        }
        Ok(())
    }
}

/// Infer the content type we stored a blob with from its extension.
fn content_type_for(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_string_lossy().to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png".to_string()),
        "txt" => Some("text/plain".to_string()),
        "json" => Some("application/json".to_string()),
        "onnx" => Some("application/octet-stream".to_string()),
        _ => None,
    }
}

impl ObjectStore for LocalDirStore {
    fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let target = self.blob_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| KneegradeError::Storage(format!("{}: {e}", parent.display())))?;
        }
        fs::write(&target, bytes)
            .map_err(|e| KneegradeError::Storage(format!("{}: {e}", target.display())))?;
        debug!(
            "Stored {} ({} bytes, {})",
            path,
            bytes.len(),
            content_type
        );
        Ok(self.url_for(path))
    }

    fn download(&self, path: &str) -> Result<Vec<u8>> {
        let source = self.blob_path(path);
        match fs::read(&source) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KneegradeError::BlobNotFound(path.to_string()))
            }
            Err(e) => Err(KneegradeError::Storage(format!(
                "{}: {e}",
                source.display()
            ))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobInfo>> {
        let mut files = Vec::new();
        // Descend from the deepest existing directory covered by the prefix;
        // a prefix with no matching directory simply lists nothing.
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            let candidate = self.blob_path(prefix.trim_end_matches('/'));
            if candidate.is_dir() {
                candidate
            } else {
                match candidate.parent() {
                    Some(parent) if parent.is_dir() => parent.to_path_buf(),
                    _ => return Ok(Vec::new()),
                }
            }
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }
        self.collect_files(&start, &mut files)?;

        let mut blobs = Vec::new();
        for file in files {
            let relative = file
                .strip_prefix(&self.root)
                .map_err(|e| KneegradeError::Storage(e.to_string()))?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !name.starts_with(prefix) {
                continue;
            }

            let metadata = fs::metadata(&file)?;
            let created_at: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());

            blobs.push(BlobInfo {
                url: self.url_for(&name),
                content_type: content_type_for(&name),
                name,
                created_at,
            });
        }

        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blob_path(path).is_file())
    }
}
