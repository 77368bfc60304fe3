//! OCI artifact assembly
//!
//! A packaged unikernel is an OCI image: a manifest referencing a config
//! blob and content-addressed layers for the kernel, optional debug kernel
//! and initrd. Layers carry well-known annotations naming their in-image
//! destination so runtimes can locate them without unpacking everything.

pub mod handler;
pub mod layer;
pub mod manifest;
pub mod reference;

pub use handler::{DirectoryHandler, StorageHandler};
pub use layer::{Blob, Layer};
pub use manifest::Manifest;
pub use reference::Reference;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Media type of an OCI image config blob
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Media type of an OCI image manifest
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of an uncompressed layer
pub const MEDIA_TYPE_IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// Standard annotation naming the image reference
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Standard annotation carrying the creation timestamp
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Annotation carrying the kiln version that produced the artifact
pub const ANNOTATION_KILN_VERSION: &str = "io.kiln.version";

/// containerd compatibility annotation carrying the full image name
pub const ANNOTATION_CONTAINERD_IMAGE_NAME: &str = "containerd.io/image.name";

/// Annotation marking a kernel layer
pub const ANNOTATION_KERNEL_PATH: &str = "org.unikraft.kernel.path";

/// Annotation marking a debug kernel layer
pub const ANNOTATION_KERNEL_DBG_PATH: &str = "org.unikraft.kernel.dbg.path";

/// Annotation marking an initrd layer
pub const ANNOTATION_INITRD_PATH: &str = "org.unikraft.initrd.path";

/// In-image destination of the kernel
pub const WELL_KNOWN_KERNEL_PATH: &str = "/unikraft/bin/kernel";

/// In-image destination of the debug kernel
pub const WELL_KNOWN_KERNEL_DBG_PATH: &str = "/unikraft/bin/kernel.dbg";

/// In-image destination of the initrd
pub const WELL_KNOWN_INITRD_PATH: &str = "/unikraft/initrd";

/// Default tag applied to untagged references
pub const DEFAULT_TAG: &str = "latest";

/// A content descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced content
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// SHA-256 digest in `sha256:<hex>` form
    pub digest: String,
    /// Size of the content in bytes
    pub size: u64,
    /// Arbitrary annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Platform the content targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// A target platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture
    pub architecture: String,
    /// Operating system
    pub os: String,
    /// OS version
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    /// OS features
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

/// An OCI image config document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// CPU architecture
    pub architecture: String,
    /// Operating system
    pub os: String,
    /// OS version
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    /// OS features
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    /// Runtime configuration
    #[serde(default)]
    pub config: RuntimeConfig,
    /// Layer diff IDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<RootFs>,
}

/// Runtime configuration within an image config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default command
    #[serde(rename = "Cmd", default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    /// Environment variables
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// User-defined labels
    #[serde(
        rename = "Labels",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
}

/// Root filesystem description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`
    #[serde(rename = "type")]
    pub kind: String,
    /// Layer digests in order
    pub diff_ids: Vec<String>,
}

/// An OCI image manifest document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSpec {
    /// Always 2
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Media type of the manifest itself
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Descriptor of the config blob
    pub config: Descriptor,
    /// Layer descriptors in order
    pub layers: Vec<Descriptor>,
    /// Manifest annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}
