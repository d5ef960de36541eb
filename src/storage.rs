//! File storage with a private and a public area, plus the upload boundary.
//!
//! ## Layout
//!
//! ```text
//! <root>/                      private disk
//! <root>/uploads/<uuid>.pdf    accepted documents (deleted after the run)
//! <root>/public/               public disk
//! <root>/public/exam_images/   image uploads and per-question image copies
//! <root>/public/answers/       rendered answer keys
//! ```
//!
//! Storage keys are paths relative to the private disk. Because the public
//! disk sits under the private root, an image upload's key is simply its
//! public path prefixed with `public/`, and both resolve to the same file.

use crate::document::{DocumentFormat, UploadedDocument};
use crate::error::IngestError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Largest upload accepted by [`Storage::accept_upload`] (10 MiB).
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Directory on the public disk for image uploads and question images.
pub const EXAM_IMAGES_DIR: &str = "exam_images";
/// Directory on the public disk for rendered answer keys.
pub const ANSWERS_DIR: &str = "answers";
/// Directory on the private disk for document uploads.
pub const UPLOADS_DIR: &str = "uploads";

const PUBLIC_PREFIX: &str = "public";

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a private-disk key to a filesystem path.
    pub fn private_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Resolve a public-disk path to a filesystem path.
    pub fn public_path(&self, rel: &str) -> PathBuf {
        self.root.join(PUBLIC_PREFIX).join(rel)
    }

    pub async fn exists(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.private_path(key))
            .await
            .unwrap_or(false)
    }

    pub async fn public_exists(&self, rel: &str) -> bool {
        tokio::fs::try_exists(self.public_path(rel))
            .await
            .unwrap_or(false)
    }

    /// Delete a private-disk file. Returns whether a file was removed;
    /// an already-missing file is not an error.
    pub async fn delete(&self, key: &str) -> Result<bool, IngestError> {
        remove_file(&self.private_path(key)).await
    }

    pub async fn delete_public(&self, rel: &str) -> Result<bool, IngestError> {
        remove_file(&self.public_path(rel)).await
    }

    /// Copy one public file to another public location.
    pub async fn copy_public(&self, from: &str, to: &str) -> Result<(), IngestError> {
        let dest = self.public_path(to);
        ensure_parent(&dest).await?;
        tokio::fs::copy(self.public_path(from), &dest)
            .await
            .map_err(|e| IngestError::storage(&dest, e))?;
        Ok(())
    }

    /// Write bytes to a public location, creating directories as needed.
    pub async fn write_public(&self, rel: &str, bytes: &[u8]) -> Result<(), IngestError> {
        let dest = self.public_path(rel);
        ensure_parent(&dest).await?;
        tokio::fs::write(&dest, bytes)
            .await
            .map_err(|e| IngestError::storage(&dest, e))
    }

    /// Accept a file into storage and describe it for the pipeline.
    ///
    /// Images are stored on the public disk so they stay addressable after
    /// the run; documents go to the private disk. Both get a fresh random
    /// name, so concurrent uploads never collide.
    pub async fn accept_upload(
        &self,
        source: &Path,
        original_name: &str,
    ) -> Result<UploadedDocument, IngestError> {
        let extension = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        let format =
            DocumentFormat::from_extension(&extension).ok_or_else(|| IngestError::UploadRejected {
                name: original_name.to_string(),
                reason: format!(
                    "extension '{extension}' is not one of pdf, docx, jpg, jpeg, png"
                ),
            })?;

        let meta = tokio::fs::metadata(source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IngestError::SourceMissing {
                    path: source.to_path_buf(),
                }
            } else {
                IngestError::storage(source, e)
            }
        })?;
        if !meta.is_file() {
            return Err(IngestError::UploadRejected {
                name: original_name.to_string(),
                reason: "not a regular file".into(),
            });
        }
        if meta.len() > MAX_UPLOAD_BYTES {
            return Err(IngestError::UploadRejected {
                name: original_name.to_string(),
                reason: format!(
                    "file is {} bytes, the limit is {} bytes",
                    meta.len(),
                    MAX_UPLOAD_BYTES
                ),
            });
        }

        let file_name = format!("{}.{}", Uuid::new_v4(), format.extension());
        let (storage_key, public_image_path, dest) = if format.is_image() {
            let rel = format!("{EXAM_IMAGES_DIR}/{file_name}");
            let dest = self.public_path(&rel);
            (format!("{PUBLIC_PREFIX}/{rel}"), Some(rel), dest)
        } else {
            let key = format!("{UPLOADS_DIR}/{file_name}");
            let dest = self.private_path(&key);
            (key, None, dest)
        };

        ensure_parent(&dest).await?;
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| IngestError::storage(&dest, e))?;
        info!("Accepted upload '{}' as {}", original_name, storage_key);

        Ok(UploadedDocument {
            storage_key,
            original_name: original_name.to_string(),
            declared_extension: extension,
            public_image_path,
        })
    }
}

async fn ensure_parent(path: &Path) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| IngestError::storage(parent, e))?;
    }
    Ok(())
}

async fn remove_file(path: &Path) -> Result<bool, IngestError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Deleted {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(IngestError::storage(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn source_file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let p = dir.path().join(name);
        tokio::fs::write(&p, bytes).await.unwrap();
        p
    }

    #[tokio::test]
    async fn documents_land_on_private_disk() {
        let root = TempDir::new().unwrap();
        let inbox = TempDir::new().unwrap();
        let storage = Storage::new(root.path());
        let src = source_file(&inbox, "Paper.PDF", b"%PDF-1.4").await;

        let doc = storage.accept_upload(&src, "Paper.PDF").await.unwrap();
        assert!(doc.storage_key.starts_with("uploads/"));
        assert!(doc.storage_key.ends_with(".pdf"));
        assert_eq!(doc.declared_extension, "PDF");
        assert!(doc.public_image_path.is_none());
        assert!(storage.exists(&doc.storage_key).await);
    }

    #[tokio::test]
    async fn images_land_on_public_disk() {
        let root = TempDir::new().unwrap();
        let inbox = TempDir::new().unwrap();
        let storage = Storage::new(root.path());
        let src = source_file(&inbox, "scan.png", b"\x89PNG").await;

        let doc = storage.accept_upload(&src, "scan.png").await.unwrap();
        let public = doc.public_image_path.clone().unwrap();
        assert!(public.starts_with("exam_images/"));
        assert_eq!(doc.storage_key, format!("public/{public}"));
        assert!(storage.public_exists(&public).await);
        assert_eq!(storage.private_path(&doc.storage_key), storage.public_path(&public));
    }

    #[tokio::test]
    async fn rejects_unsupported_extension() {
        let root = TempDir::new().unwrap();
        let inbox = TempDir::new().unwrap();
        let storage = Storage::new(root.path());
        let src = source_file(&inbox, "notes.txt", b"hello").await;

        let err = storage.accept_upload(&src, "notes.txt").await.unwrap_err();
        assert!(matches!(err, IngestError::UploadRejected { .. }));
    }

    #[tokio::test]
    async fn rejects_oversized_upload() {
        let root = TempDir::new().unwrap();
        let inbox = TempDir::new().unwrap();
        let storage = Storage::new(root.path());
        let src = inbox.path().join("big.pdf");
        let f = std::fs::File::create(&src).unwrap();
        f.set_len(MAX_UPLOAD_BYTES + 1).unwrap();

        let err = storage.accept_upload(&src, "big.pdf").await.unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[tokio::test]
    async fn delete_missing_is_not_an_error() {
        let root = TempDir::new().unwrap();
        let storage = Storage::new(root.path());
        assert!(!storage.delete("uploads/nothing.pdf").await.unwrap());
        storage.write_public("answers/a.pdf", b"x").await.unwrap();
        assert!(storage.delete_public("answers/a.pdf").await.unwrap());
        assert!(!storage.public_exists("answers/a.pdf").await);
    }
}
