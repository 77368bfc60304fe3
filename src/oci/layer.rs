//! Content-addressed blobs and image layers

use super::{Descriptor, Platform, MEDIA_TYPE_IMAGE_LAYER};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// A content-addressed blob, either in memory or staged on disk until it
/// is pushed through the storage handler.
#[derive(Debug, Clone)]
pub struct Blob {
    /// Descriptor computed from the content
    pub descriptor: Descriptor,
    /// In-memory content for small blobs
    pub data: Option<Vec<u8>>,
    /// Staged file for large blobs, pushed on save
    pub staged: Option<PathBuf>,
    /// Delete the staged file once pushed
    pub remove_after_save: bool,
}

impl Blob {
    /// Create a blob from in-memory bytes
    pub fn from_bytes(media_type: &str, data: Vec<u8>) -> Self {
        let digest = format!("sha256:{:x}", Sha256::digest(&data));
        Self {
            descriptor: Descriptor {
                media_type: media_type.to_string(),
                digest,
                size: data.len() as u64,
                annotations: BTreeMap::new(),
                platform: None,
            },
            data: Some(data),
            staged: None,
            remove_after_save: false,
        }
    }

    /// Create a blob referencing a file, hashing it in streaming fashion
    pub fn from_file(media_type: &str, path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        Ok(Self {
            descriptor: Descriptor {
                media_type: media_type.to_string(),
                digest: format!("sha256:{:x}", hasher.finalize()),
                size,
                annotations: BTreeMap::new(),
                platform: None,
            },
            data: None,
            staged: Some(path.to_path_buf()),
            remove_after_save: false,
        })
    }

    /// Attach a platform to the descriptor
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.descriptor.platform = Some(platform);
        self
    }
}

/// A single image layer: a blob plus its in-image destination
#[derive(Debug, Clone)]
pub struct Layer {
    /// The backing blob
    pub blob: Blob,
    /// In-image destination path of the layer's content
    pub dest: String,
}

impl Layer {
    /// Build a layer from a file on disk. The file is wrapped into a tar
    /// archive placing it at `dest`, staged in a temp file which is
    /// released after the layer is pushed.
    pub fn from_file(path: &Path, dest: &str) -> Result<Self> {
        let staged = std::env::temp_dir().join(format!("kiln-layer-{}", uuid::Uuid::new_v4()));

        let out = std::fs::File::create(&staged)?;
        let mut builder = tar::Builder::new(out);
        let mut source = std::fs::File::open(path)?;

        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(source.metadata()?.len());
        header.set_cksum();

        let internal = format!("./{}", dest.trim_start_matches('/'));
        builder.append_data(&mut header, internal, &mut source)?;
        builder.into_inner()?.sync_all()?;

        let mut blob = Blob::from_file(MEDIA_TYPE_IMAGE_LAYER, &staged)?;
        blob.remove_after_save = true;

        Ok(Self {
            blob,
            dest: dest.to_string(),
        })
    }

    /// Set an annotation on the layer's descriptor
    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.blob
            .descriptor
            .annotations
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Remove the staged temp file, if any
    pub fn release(&self) {
        if let Some(staged) = &self.blob.staged {
            if self.blob.remove_after_save {
                let _ = std::fs::remove_file(staged);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blob_from_bytes_is_content_addressed() {
        let a = Blob::from_bytes("application/octet-stream", b"hello".to_vec());
        let b = Blob::from_bytes("application/octet-stream", b"hello".to_vec());
        assert_eq!(a.descriptor.digest, b.descriptor.digest);
        assert_eq!(a.descriptor.size, 5);
        assert!(a.descriptor.digest.starts_with("sha256:"));
    }

    #[test]
    fn test_blob_from_file_matches_bytes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("blob");
        std::fs::write(&path, b"content").unwrap();

        let from_file = Blob::from_file("application/octet-stream", &path).unwrap();
        let from_bytes = Blob::from_bytes("application/octet-stream", b"content".to_vec());
        assert_eq!(from_file.descriptor.digest, from_bytes.descriptor.digest);
        assert_eq!(from_file.staged.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_layer_from_file_wraps_in_tar() {
        let temp = tempdir().unwrap();
        let kernel = temp.path().join("kernel");
        std::fs::write(&kernel, b"ELF...").unwrap();

        let layer = Layer::from_file(&kernel, "/unikraft/bin/kernel")
            .unwrap()
            .with_annotation(super::super::ANNOTATION_KERNEL_PATH, "/unikraft/bin/kernel");

        assert_eq!(layer.dest, "/unikraft/bin/kernel");
        assert!(layer
            .blob
            .descriptor
            .annotations
            .contains_key(super::super::ANNOTATION_KERNEL_PATH));

        // The staged blob is a tar holding the file at its destination.
        let staged = layer.blob.staged.clone().unwrap();
        let mut archive = tar::Archive::new(std::fs::File::open(&staged).unwrap());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap().to_string_lossy(),
            "./unikraft/bin/kernel"
        );

        layer.release();
        assert!(!staged.exists());
    }
}
