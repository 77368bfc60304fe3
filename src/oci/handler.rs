//! Content storage for OCI artifacts
//!
//! The manifest assembler talks to storage through the `StorageHandler`
//! capability. The directory handler keeps blobs content-addressed under
//! `blobs/sha256/` with named manifest links alongside, which is enough
//! for local packaging and for serving pulls back out of the same tree.

use super::{Descriptor, ImageConfig, ManifestSpec};
use crate::error::{KilnError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Content handed to the storage handler
#[derive(Debug, Clone)]
pub enum BlobContent {
    /// In-memory bytes
    Bytes(Vec<u8>),
    /// A file on disk
    File(PathBuf),
}

/// Storage capability used by the manifest assembler
#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// Size of the blob with the given digest, if present
    async fn digest_info(&self, digest: &str) -> Result<Option<u64>>;

    /// Persist a descriptor's content; named manifests also record a link
    /// under the reference. Returns `AlreadyExists` when the digest is
    /// already stored.
    async fn save_descriptor(
        &self,
        reference: &str,
        descriptor: &Descriptor,
        content: BlobContent,
    ) -> Result<()>;

    /// Load a manifest and its image config by digest
    async fn resolve_manifest(&self, digest: &str) -> Result<(ManifestSpec, ImageConfig)>;
}

/// Directory-backed storage handler
pub struct DirectoryHandler {
    root: PathBuf,
}

impl DirectoryHandler {
    /// Create the handler, laying out the directory structure
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs").join("sha256"))?;
        std::fs::create_dir_all(root.join("manifests"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let hash = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join("blobs").join("sha256").join(hash)
    }

    fn manifest_link_path(&self, reference: &str) -> PathBuf {
        let sanitized: String = reference
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        self.root.join("manifests").join(sanitized)
    }

    async fn read_content(content: &BlobContent) -> Result<Vec<u8>> {
        match content {
            BlobContent::Bytes(bytes) => Ok(bytes.clone()),
            BlobContent::File(path) => Ok(fs::read(path).await?),
        }
    }
}

#[async_trait]
impl StorageHandler for DirectoryHandler {
    async fn digest_info(&self, digest: &str) -> Result<Option<u64>> {
        match fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(_) => Ok(None),
        }
    }

    async fn save_descriptor(
        &self,
        reference: &str,
        descriptor: &Descriptor,
        content: BlobContent,
    ) -> Result<()> {
        let is_manifest = descriptor.media_type == super::MEDIA_TYPE_IMAGE_MANIFEST;

        if self.digest_info(&descriptor.digest).await?.is_some() {
            // Re-tagging an existing manifest still records the link.
            if is_manifest && !reference.is_empty() {
                let link = serde_json::to_vec_pretty(descriptor)?;
                fs::write(self.manifest_link_path(reference), link).await?;
            }
            return Err(KilnError::AlreadyExists(descriptor.digest.clone()));
        }

        let data = Self::read_content(&content).await?;

        let actual = format!("sha256:{:x}", Sha256::digest(&data));
        if actual != descriptor.digest {
            return Err(KilnError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            });
        }

        // Write through a temp name so a crashed save never leaves a
        // half-written blob under its final digest.
        let path = self.blob_path(&descriptor.digest);
        let tmp = path.with_extension("partial");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;

        if is_manifest && !reference.is_empty() {
            let link = serde_json::to_vec_pretty(descriptor)?;
            fs::write(self.manifest_link_path(reference), link).await?;
        }

        Ok(())
    }

    async fn resolve_manifest(&self, digest: &str) -> Result<(ManifestSpec, ImageConfig)> {
        let manifest_bytes = fs::read(self.blob_path(digest))
            .await
            .map_err(|_| KilnError::Packaging(format!("manifest {} not found", digest)))?;
        let manifest: ManifestSpec = serde_json::from_slice(&manifest_bytes)?;

        let config_bytes = fs::read(self.blob_path(&manifest.config.digest))
            .await
            .map_err(|_| {
                KilnError::Packaging(format!("config {} not found", manifest.config.digest))
            })?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes)?;

        Ok((manifest, config))
    }
}

impl DirectoryHandler {
    /// Look up a named manifest link
    pub async fn resolve_reference(&self, reference: &str) -> Result<Option<Descriptor>> {
        match fs::read(self.manifest_link_path(reference)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(_) => Ok(None),
        }
    }

    /// Read a blob's raw content by digest
    pub async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest))
            .await
            .map_err(|_| KilnError::Packaging(format!("blob {} not found", digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::Blob;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_stat_blob() {
        let temp = tempdir().unwrap();
        let handler = DirectoryHandler::new(temp.path()).unwrap();

        let blob = Blob::from_bytes("application/octet-stream", b"payload".to_vec());
        handler
            .save_descriptor("", &blob.descriptor, BlobContent::Bytes(b"payload".to_vec()))
            .await
            .unwrap();

        let size = handler.digest_info(&blob.descriptor.digest).await.unwrap();
        assert_eq!(size, Some(7));
    }

    #[tokio::test]
    async fn test_save_twice_reports_already_exists() {
        let temp = tempdir().unwrap();
        let handler = DirectoryHandler::new(temp.path()).unwrap();

        let blob = Blob::from_bytes("application/octet-stream", b"dup".to_vec());
        handler
            .save_descriptor("", &blob.descriptor, BlobContent::Bytes(b"dup".to_vec()))
            .await
            .unwrap();

        let second = handler
            .save_descriptor("", &blob.descriptor, BlobContent::Bytes(b"dup".to_vec()))
            .await;
        assert!(matches!(second, Err(KilnError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_digest_mismatch_rejected() {
        let temp = tempdir().unwrap();
        let handler = DirectoryHandler::new(temp.path()).unwrap();

        let mut blob = Blob::from_bytes("application/octet-stream", b"good".to_vec());
        blob.descriptor.digest = "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string();

        let result = handler
            .save_descriptor("", &blob.descriptor, BlobContent::Bytes(b"good".to_vec()))
            .await;
        assert!(matches!(result, Err(KilnError::DigestMismatch { .. })));
    }

    #[tokio::test]
    async fn test_manifest_link_written() {
        let temp = tempdir().unwrap();
        let handler = DirectoryHandler::new(temp.path()).unwrap();

        let manifest_json = br#"{"schemaVersion":2}"#.to_vec();
        let mut blob = Blob::from_bytes(crate::oci::MEDIA_TYPE_IMAGE_MANIFEST, manifest_json.clone());
        blob.descriptor.media_type = crate::oci::MEDIA_TYPE_IMAGE_MANIFEST.to_string();

        handler
            .save_descriptor(
                "acme/web:latest",
                &blob.descriptor,
                BlobContent::Bytes(manifest_json),
            )
            .await
            .unwrap();

        let resolved = handler.resolve_reference("acme/web:latest").await.unwrap();
        assert_eq!(resolved.unwrap().digest, blob.descriptor.digest);
    }
}
