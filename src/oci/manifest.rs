//! OCI manifest assembly
//!
//! A `Manifest` collects layers and image metadata, then `save` marshals
//! the config and manifest documents, persists them through the storage
//! handler and pushes any outstanding layer blobs in parallel. Saving is
//! idempotent: an unchanged manifest returns its cached descriptor, any
//! mutation marks it dirty and invalidates the cache.

use super::layer::{Blob, Layer};
use super::reference::Reference;
use super::{
    handler::{BlobContent, StorageHandler},
    Descriptor, ImageConfig, ManifestSpec, Platform, RootFs, ANNOTATION_CONTAINERD_IMAGE_NAME,
    ANNOTATION_CREATED, ANNOTATION_INITRD_PATH, ANNOTATION_KERNEL_DBG_PATH, ANNOTATION_KERNEL_PATH,
    ANNOTATION_KILN_VERSION, ANNOTATION_REF_NAME, MEDIA_TYPE_IMAGE_CONFIG,
    MEDIA_TYPE_IMAGE_MANIFEST, WELL_KNOWN_INITRD_PATH, WELL_KNOWN_KERNEL_DBG_PATH,
    WELL_KNOWN_KERNEL_PATH,
};
use crate::error::{KilnError, Result};
use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Progress callback invoked with the fraction of pushed blobs
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// An OCI image manifest under assembly
pub struct Manifest {
    saved: bool,
    handle: Arc<dyn StorageHandler>,
    config: ImageConfig,
    manifest: Option<ManifestSpec>,
    descriptor: Option<Descriptor>,
    layers: Vec<Layer>,
    pushed: Arc<Mutex<HashMap<String, bool>>>,
    annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Create an empty manifest over a storage handler
    pub fn new(handle: Arc<dyn StorageHandler>) -> Self {
        Self {
            saved: false,
            handle,
            config: ImageConfig::default(),
            manifest: None,
            descriptor: None,
            layers: Vec::new(),
            pushed: Arc::new(Mutex::new(HashMap::new())),
            annotations: BTreeMap::new(),
        }
    }

    /// Reconstruct a saved manifest from its digest
    pub async fn from_digest(handle: Arc<dyn StorageHandler>, digest: &str) -> Result<Self> {
        let (spec, config) = handle.resolve_manifest(digest).await?;

        let size = handle.digest_info(digest).await?.unwrap_or(0);
        let descriptor = Descriptor {
            media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
            digest: digest.to_string(),
            size,
            annotations: spec.annotations.clone(),
            platform: spec.config.platform.clone(),
        };

        let layers = spec
            .layers
            .iter()
            .map(|desc| Layer {
                blob: Blob {
                    descriptor: desc.clone(),
                    data: None,
                    staged: None,
                    remove_after_save: false,
                },
                dest: String::new(),
            })
            .collect();

        Ok(Self {
            saved: true,
            handle,
            config,
            annotations: spec.annotations.clone(),
            manifest: Some(spec),
            descriptor: Some(descriptor),
            layers,
            pushed: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn dirty(&mut self) {
        self.saved = false;
        self.manifest = None;
        self.descriptor = None;
    }

    /// The layers of this image
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Add a layer and return its descriptor
    pub fn add_layer(&mut self, layer: Layer) -> Descriptor {
        tracing::trace!(
            dest = %layer.dest,
            digest = %layer.blob.descriptor.digest,
            media_type = %layer.blob.descriptor.media_type,
            "layering"
        );

        let descriptor = layer.blob.descriptor.clone();
        if let Ok(mut pushed) = self.pushed.lock() {
            pushed.insert(descriptor.digest.clone(), false);
        }
        self.dirty();
        self.layers.push(layer);
        descriptor
    }

    /// Persist a blob through the storage handler, skipping blobs already
    /// present; staged temp files are released after the push.
    pub async fn add_blob(&self, reference: &str, blob: &Blob) -> Result<Descriptor> {
        if self
            .handle
            .digest_info(&blob.descriptor.digest)
            .await?
            .is_some()
        {
            tracing::trace!(
                digest = %blob.descriptor.digest,
                media_type = %blob.descriptor.media_type,
                "blob already exists"
            );
            return Ok(blob.descriptor.clone());
        }

        let content = match (&blob.data, &blob.staged) {
            (Some(bytes), _) => BlobContent::Bytes(bytes.clone()),
            (None, Some(path)) => BlobContent::File(path.clone()),
            (None, None) => {
                return Err(KilnError::Packaging(format!(
                    "blob {} has no content",
                    blob.descriptor.digest
                )))
            }
        };

        match self
            .handle
            .save_descriptor(reference, &blob.descriptor, content)
            .await
        {
            Ok(()) | Err(KilnError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        if blob.remove_after_save {
            if let Some(staged) = &blob.staged {
                let _ = std::fs::remove_file(staged);
            }
        }

        Ok(blob.descriptor.clone())
    }

    fn set_well_known(&mut self, annotation: &'static str, dest: &str, path: &Path) -> Result<()> {
        tracing::debug!(src = %path.display(), dest = %dest, "including layer");

        // A well-known layer is a singleton: drop any existing one along
        // with its staged temp file.
        let mut kept = Vec::with_capacity(self.layers.len());
        for layer in self.layers.drain(..) {
            if layer.blob.descriptor.annotations.contains_key(annotation) {
                layer.release();
            } else {
                kept.push(layer);
            }
        }
        self.layers = kept;

        let layer = Layer::from_file(path, dest)?.with_annotation(annotation, dest);
        self.add_layer(layer);
        Ok(())
    }

    /// Set the kernel of the image
    pub fn set_kernel(&mut self, path: &Path) -> Result<()> {
        self.set_well_known(ANNOTATION_KERNEL_PATH, WELL_KNOWN_KERNEL_PATH, path)
    }

    /// Set the debug kernel of the image
    pub fn set_kernel_dbg(&mut self, path: &Path) -> Result<()> {
        self.set_well_known(ANNOTATION_KERNEL_DBG_PATH, WELL_KNOWN_KERNEL_DBG_PATH, path)
    }

    /// Set the initrd of the image
    pub fn set_initrd(&mut self, path: &Path) -> Result<()> {
        self.set_well_known(ANNOTATION_INITRD_PATH, WELL_KNOWN_INITRD_PATH, path)
    }

    /// Set a label on the image config
    pub fn set_label(&mut self, key: &str, value: &str) {
        self.dirty();
        self.config
            .config
            .labels
            .insert(key.to_string(), value.to_string());
    }

    /// Set a manifest annotation
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.dirty();
        self.annotations.insert(key.to_string(), value.to_string());
    }

    /// Set the architecture of the image
    pub fn set_architecture(&mut self, architecture: &str) {
        self.dirty();
        self.config.architecture = architecture.to_string();
    }

    /// Set the OS of the image
    pub fn set_os(&mut self, os: &str) {
        self.dirty();
        self.config.os = os.to_string();
    }

    /// Set the OS version of the image
    pub fn set_os_version(&mut self, version: &str) {
        self.dirty();
        self.config.os_version = version.to_string();
    }

    /// Append OS features to the image
    pub fn set_os_feature(&mut self, features: &[&str]) {
        self.dirty();
        self.config
            .os_features
            .extend(features.iter().map(|f| f.to_string()));
    }

    /// Set the command of the image
    pub fn set_cmd(&mut self, cmd: Vec<String>) {
        self.dirty();
        self.config.config.cmd = cmd;
    }

    /// Set the environment variables of the image
    pub fn set_env(&mut self, env: Vec<String>) {
        self.dirty();
        self.config.config.env = env;
    }

    /// Save the image and return its manifest descriptor.
    pub async fn save(
        &mut self,
        fullref: &str,
        on_progress: Option<ProgressFn>,
    ) -> Result<Descriptor> {
        if self.saved {
            if let Some(descriptor) = &self.descriptor {
                return Ok(descriptor.clone());
            }
        }

        if let Some(descriptor) = &self.descriptor {
            if self.handle.digest_info(&descriptor.digest).await?.is_some() {
                return Ok(descriptor.clone());
            }
        }

        let reference = Reference::parse(fullref)?;

        // The manifest layers double as the config's rootfs diff IDs.
        let layer_descs: Vec<Descriptor> = self
            .layers
            .iter()
            .map(|l| l.blob.descriptor.clone())
            .collect();
        if !layer_descs.is_empty() {
            self.config.rootfs = Some(RootFs {
                kind: "layers".to_string(),
                diff_ids: layer_descs.iter().map(|d| d.digest.clone()).collect(),
            });
        }

        normalize_os_features(&mut self.config.os_features);

        let platform = Platform {
            architecture: self.config.architecture.clone(),
            os: self.config.os.clone(),
            os_version: self.config.os_version.clone(),
            os_features: self.config.os_features.clone(),
        };

        let config_json = serde_json::to_vec(&self.config)?;
        let config_blob =
            Blob::from_bytes(MEDIA_TYPE_IMAGE_CONFIG, config_json).with_platform(platform.clone());

        self.annotations
            .insert(ANNOTATION_REF_NAME.to_string(), reference.context());
        self.annotations.insert(
            ANNOTATION_CREATED.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        self.annotations.insert(
            ANNOTATION_KILN_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        self.annotations
            .insert(ANNOTATION_CONTAINERD_IMAGE_NAME.to_string(), reference.name());

        let manifest_spec = match self.manifest.take() {
            Some(spec) => spec,
            None => ManifestSpec {
                schema_version: 2,
                media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                config: config_blob.descriptor.clone(),
                layers: layer_descs,
                annotations: self.annotations.clone(),
            },
        };

        let manifest_json = serde_json::to_vec(&manifest_spec)?;
        self.manifest = Some(manifest_spec);

        let descriptor = match self.descriptor.take() {
            Some(descriptor) => descriptor,
            None => Descriptor {
                media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                digest: format!("sha256:{:x}", Sha256::digest(&manifest_json)),
                size: manifest_json.len() as u64,
                annotations: self.annotations.clone(),
                platform: Some(platform),
            },
        };
        self.descriptor = Some(descriptor.clone());

        tracing::debug!(
            reference = %reference.name(),
            digest = %descriptor.digest,
            "saving manifest"
        );

        match self
            .handle
            .save_descriptor(
                &reference.name(),
                &descriptor,
                BlobContent::Bytes(manifest_json),
            )
            .await
        {
            Ok(()) | Err(KilnError::AlreadyExists(_)) => {}
            Err(e) => return Err(KilnError::Packaging(format!("failed to save manifest: {}", e))),
        }

        // The config blob is written after the manifest so a collector
        // scanning the store never sees it unreferenced.
        if self
            .handle
            .digest_info(&config_blob.descriptor.digest)
            .await?
            .is_none()
        {
            self.add_blob(&reference.name(), &config_blob).await?;
        }

        self.saved = true;

        // Push any outstanding layer blobs last, in parallel; the first
        // failure aborts the remainder.
        let total = self.layers.len().max(1);
        let completed = Arc::new(Mutex::new(0usize));

        let mut tasks = tokio::task::JoinSet::new();
        for layer in &self.layers {
            let Some(staged) = layer.blob.staged.clone() else {
                continue;
            };

            let already = self
                .pushed
                .lock()
                .map_err(|_| KilnError::Lock("pushed map poisoned".to_string()))?
                .get(&layer.blob.descriptor.digest)
                .copied()
                .unwrap_or(false);
            if already {
                continue;
            }

            if self
                .handle
                .digest_info(&layer.blob.descriptor.digest)
                .await?
                .is_some()
            {
                continue;
            }

            let handle = Arc::clone(&self.handle);
            let pushed = Arc::clone(&self.pushed);
            let completed = Arc::clone(&completed);
            let on_progress = on_progress.clone();
            let descriptor = layer.blob.descriptor.clone();
            let remove_after_save = layer.blob.remove_after_save;
            let reference = reference.name();

            tasks.spawn(async move {
                match handle
                    .save_descriptor(&reference, &descriptor, BlobContent::File(staged.clone()))
                    .await
                {
                    Ok(()) | Err(KilnError::AlreadyExists(_)) => {}
                    Err(e) => {
                        return Err(KilnError::Packaging(format!(
                            "failed to push layer {}: {}",
                            descriptor.digest, e
                        )))
                    }
                }

                if let Ok(mut pushed) = pushed.lock() {
                    pushed.insert(descriptor.digest.clone(), true);
                }

                if remove_after_save {
                    let _ = std::fs::remove_file(&staged);
                }

                if let Some(on_progress) = on_progress {
                    if let Ok(mut done) = completed.lock() {
                        *done += 1;
                        on_progress(*done as f64 / total as f64);
                    }
                }

                Ok(())
            });
        }

        while let Some(result) = tasks.join_next().await {
            let pushed = result
                .map_err(|e| KilnError::Internal(format!("layer push task panicked: {}", e)))?;
            if let Err(e) = pushed {
                tasks.abort_all();
                return Err(e);
            }
        }

        Ok(descriptor)
    }
}

/// Sort OS features into a total order and remove duplicates: numeric
/// tokens first in numeric order, then the rest lexically.
pub fn normalize_os_features(features: &mut Vec<String>) {
    features.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
    features.dedup();
}
