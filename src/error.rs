//! Error types for kiln

use thiserror::Error;

/// Result type for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;

/// kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    #[error("No compose file found in {0}")]
    NoComposeFile(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Invalid project: {0}")]
    InvalidProject(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service {service} references unknown network {network}")]
    ReferencesUnknownNetwork { service: String, network: String },

    #[error("Cyclic dependency: {from} -> {to}")]
    CyclicDependency { from: String, to: String },

    #[error("Network {0} has an invalid subnet")]
    InvalidSubnet(String),

    #[error("Not enough free IP addresses in network {0}")]
    SubnetExhausted(String),

    #[error("File {0} is not a Dockerfile")]
    NotADockerfile(String),

    #[error("Invalid build secret: {0}")]
    SecretSyntax(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Malformed tar archive: {0}")]
    MalformedTar(String),

    #[error("Invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Packaging error: {0}")]
    Packaging(String),

    #[error("Blob digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Blob already exists: {0}")]
    AlreadyExists(String),

    #[error("Machine error: {0}")]
    Machine(String),

    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Process exit code for this error: 1 for input errors, 2 for
    /// orchestration errors, 130 when canceled.
    pub fn exit_code(&self) -> i32 {
        match self {
            KilnError::NoComposeFile(_)
            | KilnError::ComposeParse(_)
            | KilnError::InvalidProject(_)
            | KilnError::ServiceNotFound(_)
            | KilnError::ReferencesUnknownNetwork { .. }
            | KilnError::CyclicDependency { .. }
            | KilnError::InvalidSubnet(_)
            | KilnError::NotADockerfile(_)
            | KilnError::SecretSyntax(_)
            | KilnError::InvalidReference { .. }
            | KilnError::Yaml(_) => 1,
            KilnError::Canceled => 130,
            _ => 2,
        }
    }
}
