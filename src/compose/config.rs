//! Compose file configuration types
//!
//! These are the YAML-facing types. They tolerate both the short and long
//! Compose syntaxes; `project` normalizes them into the validated model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version (informational, ignored)
    #[serde(default)]
    pub version: Option<String>,
    /// Top-level project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// Networks
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,
    /// Volumes
    #[serde(default)]
    pub volumes: HashMap<String, VolumeConfig>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Container name
    #[serde(default)]
    pub container_name: Option<String>,
    /// Platform in `<plat>/<arch>` form
    #[serde(default)]
    pub platform: Option<String>,
    /// Hostname
    #[serde(default)]
    pub hostname: Option<String>,
    /// Domain name
    #[serde(default)]
    pub domainname: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default)]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Networks to attach to
    #[serde(default)]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// DNS servers
    #[serde(default)]
    pub dns: Option<DnsConfig>,
    /// Memory limit in bytes or with a unit suffix
    #[serde(default)]
    pub mem_limit: Option<MemoryConfig>,
    /// Memory reservation in bytes or with a unit suffix
    #[serde(default)]
    pub mem_reservation: Option<MemoryConfig>,
    /// Deploy configuration (resources only)
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

impl BuildConfig {
    /// The build context path
    pub fn context(&self) -> &str {
        match self {
            BuildConfig::Simple(path) => path,
            BuildConfig::Full(full) => full.context.as_deref().unwrap_or("."),
        }
    }
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    pub context: Option<String>,
    /// Dockerfile path relative to the context
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default)]
    pub args: Option<HashMap<String, String>>,
    /// Target stage
    pub target: Option<String>,
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value; a missing value is passed through from the host
    Map(HashMap<String, Option<String>>),
}

/// DNS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DnsConfig {
    /// Single server
    Single(String),
    /// Multiple servers
    Multiple(Vec<String>),
}

impl DnsConfig {
    /// The configured servers in order
    pub fn servers(&self) -> Vec<String> {
        match self {
            DnsConfig::Single(s) => vec![s.clone()],
            DnsConfig::Multiple(v) => v.clone(),
        }
    }
}

/// Memory size, either raw bytes or a string with a unit suffix
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemoryConfig {
    /// Raw byte count
    Bytes(u64),
    /// String form, e.g. "512m" or "2g"
    Text(String),
}

impl MemoryConfig {
    /// Parse into bytes; unparseable strings yield 0.
    pub fn as_bytes(&self) -> u64 {
        match self {
            MemoryConfig::Bytes(b) => *b,
            MemoryConfig::Text(s) => parse_memory(s),
        }
    }
}

/// Parse a memory string like "512m", "2gb" or "1048576" into bytes
pub fn parse_memory(s: &str) -> u64 {
    let s = s.trim().to_lowercase();
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: u64 = match digits.parse() {
        Ok(v) => v,
        Err(_) => return 0,
    };

    match s[digits.len()..].trim() {
        "" | "b" => value,
        "k" | "kb" => value * 1024,
        "m" | "mb" => value * 1024 * 1024,
        "g" | "gb" => value * 1024 * 1024 * 1024,
        _ => 0,
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "[host-ip:]host:container[/proto]"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in the machine
    pub target: u16,
    /// Published port on the host
    pub published: Option<String>,
    /// Host IP to bind to
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target[:mode]"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Source path or volume name
    pub source: Option<String>,
    /// Target path in the machine
    pub target: String,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to attachment config
    Map(HashMap<String, Option<ServiceNetworkConfig>>),
}

/// Service network attachment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Static IPv4 address
    pub ipv4_address: Option<String>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names (all required)
    Array(Vec<String>),
    /// Map of service to condition
    Map(HashMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default)]
    pub condition: Option<String>,
    /// Whether the dependency must be satisfied before starting
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Default for DependsOnCondition {
    fn default() -> Self {
        Self {
            condition: None,
            required: true,
        }
    }
}

fn default_required() -> bool {
    true
}

/// Deploy configuration, of which only resource limits are honored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Resource limits and reservations
    pub resources: Option<ResourcesConfig>,
}

/// Resources configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Resource limits
    pub limits: Option<ResourceSpec>,
    /// Resource reservations
    pub reservations: Option<ResourceSpec>,
}

/// Resource specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Memory limit/reservation
    pub memory: Option<MemoryConfig>,
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    pub driver: Option<String>,
    /// IPAM configuration
    pub ipam: Option<IpamConfig>,
    /// External network
    pub external: Option<ExternalConfig>,
    /// Name override
    pub name: Option<String>,
}

/// IPAM configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamConfig {
    /// Driver
    pub driver: Option<String>,
    /// Config blocks
    #[serde(default)]
    pub config: Option<Vec<IpamPoolConfig>>,
}

/// IPAM pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamPoolConfig {
    /// Subnet in CIDR form
    pub subnet: Option<String>,
    /// Gateway address
    pub gateway: Option<String>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    pub driver: Option<String>,
    /// External volume
    pub external: Option<ExternalConfig>,
    /// Name override
    pub name: Option<String>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name
    Named { name: String },
}

impl ExternalConfig {
    /// Whether the resource is external
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("1048576"), 1048576);
        assert_eq!(parse_memory("512m"), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2gb"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("64K"), 64 * 1024);
        assert_eq!(parse_memory("not-a-size"), 0);
    }

    #[test]
    fn test_build_config_context() {
        let simple = BuildConfig::Simple("./app".to_string());
        assert_eq!(simple.context(), "./app");

        let full = BuildConfig::Full(BuildConfigFull {
            context: None,
            ..Default::default()
        });
        assert_eq!(full.context(), ".");
    }

    #[test]
    fn test_external_config() {
        assert!(ExternalConfig::Bool(true).is_external());
        assert!(!ExternalConfig::Bool(false).is_external());
        assert!(ExternalConfig::Named {
            name: "shared".to_string()
        }
        .is_external());
    }
}
