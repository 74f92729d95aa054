// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! On-disk storage for uploaded blobs

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::Result;

/// Directory of uploaded files, each named by record id plus original extension
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store, creating its directory if needed
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
            info!("Created upload directory: {:?}", root);
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage path for a record id and the client's original file name
    pub fn path_for(&self, id: &str, original_name: &str) -> PathBuf {
        match storage_extension(original_name) {
            Some(ext) => self.root.join(format!("{}.{}", id, ext)),
            None => self.root.join(id),
        }
    }

    /// Write the bytes and return where they landed
    pub async fn save(&self, id: &str, original_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(id, original_name);
        tokio::fs::write(&path, bytes).await?;
        debug!("Stored {} bytes at {:?}", bytes.len(), path);
        Ok(path)
    }

    /// Delete a blob. A blob that is already gone counts as removed.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Removed blob {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Extension of the original name, restricted to characters safe in a file name
fn storage_extension(original_name: &str) -> Option<String> {
    let ext = Path::new(original_name).extension()?.to_str()?;
    let clean: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    if clean.is_empty() { None } else { Some(clean) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_keeps_extension() {
        let store = BlobStore { root: PathBuf::from("/data") };
        assert_eq!(store.path_for("abc", "scene.TIF"), PathBuf::from("/data/abc.tif"));
        assert_eq!(store.path_for("abc", "archive.tar.gz"), PathBuf::from("/data/abc.gz"));
        assert_eq!(store.path_for("abc", "README"), PathBuf::from("/data/abc"));
        assert_eq!(store.path_for("abc", "../../evil.p/ng"), PathBuf::from("/data/abc"));
    }

    #[tokio::test]
    async fn test_save_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("uploads")).unwrap();

        let path = store.save("id1", "frame.jpg", b"jpeg-bytes").await.unwrap();
        assert!(path.starts_with(store.root()));
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");

        store.remove(&path).await.unwrap();
        assert!(!path.exists());
        store.remove(&path).await.unwrap();
    }
}
