use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of CAO exports. Identical exports for the same
/// dealership and day share one file.
#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn export_relative_path(
        &self,
        created_at: DateTime<Utc>,
        dealership_slug: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = created_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "csv" } else { ext };
        PathBuf::from(dealership_slug)
            .join(day)
            .join(format!("{}.{ext}", &content_hash[..content_hash.len().min(16)]))
    }

    /// Writes bytes through a temp file and an atomic rename.
    pub async fn store_bytes(
        &self,
        created_at: DateTime<Utc>,
        dealership_slug: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredExport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.export_relative_path(created_at, dealership_slug, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating export directory {}", parent.display()))?;

        let stored = |deduplicated| StoredExport {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking export path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp export {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn export_hashing_is_stable() {
        assert_eq!(
            ExportStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn export_paths_group_by_dealership_and_day() {
        let store = ExportStore::new("/exports");
        let at = DateTime::parse_from_rfc3339("2024-05-06T15:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = store.export_relative_path(at, "columbia_honda", "abcdef0123456789ffff", ".csv");
        assert_eq!(path, PathBuf::from("columbia_honda/20240506/abcdef0123456789.csv"));
    }

    #[tokio::test]
    async fn identical_exports_deduplicate() {
        let dir = tempdir().expect("tempdir");
        let store = ExportStore::new(dir.path());
        let at = DateTime::parse_from_rfc3339("2024-05-06T15:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(at, "columbia_honda", "csv", b"stock,vin\nH1,VIN1\n")
            .await
            .expect("first store");
        let second = store
            .store_bytes(at, "columbia_honda", "csv", b"stock,vin\nH1,VIN1\n")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }
}
