//! Machine management
//!
//! A machine is a managed unikernel instance. Hypervisor back-ends are
//! modeled as the `MachinePlatform` capability with a fixed operation set;
//! the iterator merges several back-ends behind one interface.

pub mod network;
pub mod platform;
pub mod volume;

pub use network::NetworkService;
pub use platform::{LocalPlatform, PlatformIterator};
pub use volume::VolumeService;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Machine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Spec accepted but not yet realized
    Pending,
    /// Created and ready to start
    Created,
    /// Running
    Running,
    /// Suspended
    Paused,
    /// Exited
    Exited,
    /// Failed to create or start
    Errored,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Pending => write!(f, "pending"),
            MachineState::Created => write!(f, "created"),
            MachineState::Running => write!(f, "running"),
            MachineState::Paused => write!(f, "paused"),
            MachineState::Exited => write!(f, "exited"),
            MachineState::Errored => write!(f, "errored"),
        }
    }
}

/// Specification for creating a machine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Machine name, unique per platform
    pub name: String,
    /// Platform half of `<plat>/<arch>`
    pub platform: String,
    /// Architecture half of `<plat>/<arch>`
    pub arch: String,
    /// Kernel image path
    pub kernel: PathBuf,
    /// Initrd archive path
    pub initrd: Option<PathBuf>,
    /// Boot arguments
    pub args: Vec<String>,
    /// Environment list
    pub env: Vec<String>,
    /// Memory in bytes; a platform default applies when zero
    pub memory_bytes: u64,
    /// Rendered network attachments
    /// (`<net>:<cidr>,dns0=…,dns1=…,hostname=…,domain=…`)
    pub networks: Vec<String>,
    /// Rendered port mappings (`<host-ip>:<host-port>:<port>/<proto>`)
    pub ports: Vec<String>,
    /// Rendered volume mounts (`<src>:<dst>`)
    pub volumes: Vec<String>,
}

/// A managed unikernel instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Unique ID
    pub id: String,
    /// Machine spec
    pub spec: MachineSpec,
    /// Current state
    pub state: MachineState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Hypervisor process ID when running
    pub pid: Option<u32>,
    /// Exit code once exited
    pub exit_code: Option<i32>,
}

/// Capability implemented by every hypervisor back-end
#[async_trait]
pub trait MachinePlatform: Send + Sync {
    /// Name of the platform (e.g. `qemu`)
    fn name(&self) -> &str;

    /// Create a machine from a spec
    async fn create(&self, spec: MachineSpec) -> Result<Machine>;

    /// Start a created or exited machine
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop a running machine
    async fn stop(&self, name: &str) -> Result<()>;

    /// Suspend a running machine
    async fn pause(&self, name: &str) -> Result<()>;

    /// Resume a paused machine
    async fn unpause(&self, name: &str) -> Result<()>;

    /// Remove a machine, stopping it first if necessary
    async fn remove(&self, name: &str) -> Result<()>;

    /// Look up a machine by name
    async fn get(&self, name: &str) -> Result<Option<Machine>>;

    /// List all machines
    async fn list(&self) -> Result<Vec<Machine>>;
}
