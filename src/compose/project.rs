//! Validated compose project model
//!
//! `Project::from_config` normalizes the YAML-facing types into a model the
//! orchestrator can rely on: unique service names, resolved container names,
//! a `<plat>/<arch>` platform per service, parsed port and volume mappings.
//! Projects are immutable after validation, except for IP assignment which
//! fills in missing addresses in place.

use super::config::{
    ComposeConfig, DependsOnConfig, EnvironmentConfig, NetworksConfig, PortConfig, ServiceConfig,
    VolumeMount,
};
use crate::error::{KilnError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Default platform used when a service does not specify one
pub fn default_platform() -> String {
    format!("qemu/{}", std::env::consts::ARCH)
}

/// A validated compose project
#[derive(Debug, Clone)]
pub struct Project {
    /// Project name
    pub name: String,
    /// Working directory the project is rooted in
    pub workdir: PathBuf,
    /// Source compose file paths
    pub compose_files: Vec<PathBuf>,
    /// Services ordered by name
    pub services: Vec<Service>,
    /// Networks by name
    pub networks: BTreeMap<String, Network>,
    /// Volumes by name
    pub volumes: BTreeMap<String, Volume>,
}

/// A validated service
#[derive(Debug, Clone)]
pub struct Service {
    /// Service name
    pub name: String,
    /// Image reference, normalized to `name:tag`
    pub image: Option<String>,
    /// Build specification
    pub build: Option<BuildSpec>,
    /// Machine name, defaults to `<project>-<service>`
    pub container_name: String,
    /// Platform in `<plat>/<arch>` form
    pub platform: String,
    /// Hostname
    pub hostname: Option<String>,
    /// Domain name
    pub domainname: Option<String>,
    /// Environment variables; a `None` value is passed through by key only
    pub environment: BTreeMap<String, Option<String>>,
    /// Port mappings
    pub ports: Vec<PortMapping>,
    /// Volume mounts
    pub volumes: Vec<ServiceVolume>,
    /// Network attachments by network name
    pub networks: BTreeMap<String, ServiceNetwork>,
    /// Dependencies by service name
    pub depends_on: BTreeMap<String, Dependency>,
    /// DNS servers (only the first two are honored at machine create)
    pub dns: Vec<String>,
    /// Memory limit in bytes, 0 when unset
    pub mem_limit: u64,
    /// Memory reservation in bytes, 0 when unset
    pub mem_reservation: u64,
}

/// Build specification for a service
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    /// Context directory, relative to the project workdir
    pub context: String,
    /// Dockerfile path relative to the context
    pub dockerfile: Option<String>,
    /// Build arguments
    pub args: HashMap<String, String>,
    /// Target stage
    pub target: Option<String>,
}

/// A parsed port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Host IP to bind to
    pub host_ip: String,
    /// Published port on the host
    pub host_port: String,
    /// Target port in the machine
    pub container_port: u16,
    /// Protocol
    pub protocol: String,
}

/// A service volume mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceVolume {
    /// Source path or volume name
    pub source: String,
    /// Target path in the machine
    pub target: String,
}

/// A service network attachment
#[derive(Debug, Clone, Default)]
pub struct ServiceNetwork {
    /// IPv4 address, static or assigned
    pub ipv4_address: Option<String>,
}

/// A service dependency
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Whether the dependency must be satisfied before starting
    pub required: bool,
}

/// A validated network
#[derive(Debug, Clone)]
pub struct Network {
    /// Network name
    pub name: String,
    /// External networks are neither created nor removed
    pub external: bool,
    /// Driver name
    pub driver: String,
    /// IPAM subnet in CIDR form
    pub subnet: Option<String>,
    /// IPAM gateway; defaulted to the subnet base during IP assignment
    pub gateway: Option<String>,
}

/// A validated volume
#[derive(Debug, Clone)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// External volumes are neither created nor removed
    pub external: bool,
    /// Driver name
    pub driver: String,
}

impl Project {
    /// Validate and normalize a parsed compose config into a project.
    pub fn from_config(
        mut config: ComposeConfig,
        workdir: &Path,
        compose_file: &Path,
    ) -> Result<Self> {
        let name = match config.name.take() {
            Some(name) if !name.is_empty() => name,
            _ => workdir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "default".to_string()),
        };

        let mut networks = BTreeMap::new();
        for (net_name, net) in &config.networks {
            let external = net.external.as_ref().map(|e| e.is_external()).unwrap_or(false);
            // Merge IPAM config blocks front to back, later entries win.
            let mut subnet = None;
            let mut gateway = None;
            if let Some(ipam) = &net.ipam {
                for block in ipam.config.iter().flatten() {
                    if block.subnet.as_deref().is_some_and(|s| !s.is_empty()) {
                        subnet = block.subnet.clone();
                    }
                    if block.gateway.as_deref().is_some_and(|g| !g.is_empty()) {
                        gateway = block.gateway.clone();
                    }
                }
            }

            networks.insert(
                net_name.clone(),
                Network {
                    name: net.name.clone().unwrap_or_else(|| net_name.clone()),
                    external,
                    driver: net.driver.clone().unwrap_or_else(|| "bridge".to_string()),
                    subnet,
                    gateway,
                },
            );
        }

        let mut volumes = BTreeMap::new();
        for (vol_name, vol) in &config.volumes {
            let external = vol.external.as_ref().map(|e| e.is_external()).unwrap_or(false);
            volumes.insert(
                vol_name.clone(),
                Volume {
                    name: vol.name.clone().unwrap_or_else(|| vol_name.clone()),
                    external,
                    driver: vol.driver.clone().unwrap_or_else(|| "local".to_string()),
                },
            );
        }

        let mut service_names: Vec<String> = config.services.keys().cloned().collect();
        service_names.sort();

        let mut services = Vec::with_capacity(service_names.len());
        for svc_name in service_names {
            let Some(svc) = config.services.remove(&svc_name) else {
                continue;
            };
            let service = normalize_service(&name, &svc_name, svc)?;

            if service.image.is_none() && service.build.is_none() {
                return Err(KilnError::InvalidProject(format!(
                    "service {} has neither an image nor a build context",
                    svc_name
                )));
            }

            for net_name in service.networks.keys() {
                if !networks.contains_key(net_name) {
                    return Err(KilnError::ReferencesUnknownNetwork {
                        service: svc_name.clone(),
                        network: net_name.clone(),
                    });
                }
            }

            for vol in &service.volumes {
                if !is_bind_path(&vol.source) && !volumes.contains_key(&vol.source) {
                    return Err(KilnError::InvalidProject(format!(
                        "service {} references non-existent volume {}",
                        svc_name, vol.source
                    )));
                }
            }

            services.push(service);
        }

        // Dependencies must refer to services in the project.
        let known: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        for service in &services {
            for dep in service.depends_on.keys() {
                if !known.contains(&dep.as_str()) {
                    return Err(KilnError::InvalidProject(format!(
                        "service {} depends on unknown service {}",
                        service.name, dep
                    )));
                }
            }
        }

        Ok(Self {
            name,
            workdir: workdir.to_path_buf(),
            compose_files: vec![compose_file.to_path_buf()],
            services,
            networks,
            volumes,
        })
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Select services by name, or all services when `names` is empty.
    pub fn get_services(&self, names: &[String]) -> Result<Vec<Service>> {
        if names.is_empty() {
            return Ok(self.services.clone());
        }

        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let service = self
                .service(name)
                .ok_or_else(|| KilnError::ServiceNotFound(name.clone()))?;
            selected.push(service.clone());
        }
        Ok(selected)
    }
}

impl Service {
    /// Split the platform field into its platform and architecture halves.
    pub fn plat_arch(&self) -> Result<(&str, &str)> {
        self.platform.split_once('/').ok_or_else(|| {
            KilnError::InvalidProject(format!(
                "service {} has invalid platform {}",
                self.name, self.platform
            ))
        })
    }

    /// Memory in bytes for machine creation: limit if positive, else
    /// reservation.
    pub fn memory_bytes(&self) -> u64 {
        if self.mem_limit > 0 {
            self.mem_limit
        } else {
            self.mem_reservation
        }
    }

    /// Environment as a `KEY=value` list; keys without a value are passed
    /// through bare.
    pub fn environ(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect()
    }
}

/// Whether a volume source is a host path rather than a named volume
fn is_bind_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

fn normalize_service(project_name: &str, name: &str, svc: ServiceConfig) -> Result<Service> {
    let image = svc.image.as_deref().map(normalize_image_ref);

    let build = svc.build.as_ref().map(|b| match b {
        super::config::BuildConfig::Simple(path) => BuildSpec {
            context: path.clone(),
            ..Default::default()
        },
        super::config::BuildConfig::Full(full) => BuildSpec {
            context: full.context.clone().unwrap_or_else(|| ".".to_string()),
            dockerfile: full.dockerfile.clone(),
            args: full.args.clone().unwrap_or_default(),
            target: full.target.clone(),
        },
    });

    let container_name = match svc.container_name {
        Some(name) if !name.is_empty() => name,
        _ => format!("{}-{}", project_name, name),
    };

    let platform = match svc.platform {
        Some(p) if !p.is_empty() => p,
        _ => default_platform(),
    };

    let environment = match svc.environment {
        Some(EnvironmentConfig::Map(map)) => map.into_iter().collect(),
        Some(EnvironmentConfig::Array(arr)) => {
            let mut map = BTreeMap::new();
            for item in arr {
                match item.split_once('=') {
                    Some((k, v)) => map.insert(k.to_string(), Some(v.to_string())),
                    None => map.insert(item, None),
                };
            }
            map
        }
        None => BTreeMap::new(),
    };

    let mut ports = Vec::new();
    for port in svc.ports.iter().flatten() {
        ports.push(parse_port(name, port)?);
    }

    let mut volumes = Vec::new();
    for vol in svc.volumes.iter().flatten() {
        volumes.push(parse_volume(name, vol)?);
    }

    let networks = match svc.networks {
        Some(NetworksConfig::Array(arr)) => arr
            .into_iter()
            .map(|n| (n, ServiceNetwork::default()))
            .collect(),
        Some(NetworksConfig::Map(map)) => map
            .into_iter()
            .map(|(n, cfg)| {
                (
                    n,
                    ServiceNetwork {
                        ipv4_address: cfg.and_then(|c| c.ipv4_address),
                    },
                )
            })
            .collect(),
        None => BTreeMap::new(),
    };

    let depends_on = match svc.depends_on {
        Some(DependsOnConfig::Array(arr)) => arr
            .into_iter()
            .map(|n| (n, Dependency { required: true }))
            .collect(),
        Some(DependsOnConfig::Map(map)) => map
            .into_iter()
            .map(|(n, cond)| {
                (
                    n,
                    Dependency {
                        required: cond.required,
                    },
                )
            })
            .collect(),
        None => BTreeMap::new(),
    };

    let mem_limit = svc
        .mem_limit
        .as_ref()
        .map(|m| m.as_bytes())
        .or_else(|| {
            svc.deploy
                .as_ref()
                .and_then(|d| d.resources.as_ref())
                .and_then(|r| r.limits.as_ref())
                .and_then(|l| l.memory.as_ref())
                .map(|m| m.as_bytes())
        })
        .unwrap_or(0);

    let mem_reservation = svc
        .mem_reservation
        .as_ref()
        .map(|m| m.as_bytes())
        .or_else(|| {
            svc.deploy
                .as_ref()
                .and_then(|d| d.resources.as_ref())
                .and_then(|r| r.reservations.as_ref())
                .and_then(|l| l.memory.as_ref())
                .map(|m| m.as_bytes())
        })
        .unwrap_or(0);

    Ok(Service {
        name: name.to_string(),
        image,
        build,
        container_name,
        platform,
        hostname: svc.hostname,
        domainname: svc.domainname,
        environment,
        ports,
        volumes,
        networks,
        depends_on,
        dns: svc.dns.map(|d| d.servers()).unwrap_or_default(),
        mem_limit,
        mem_reservation,
    })
}

/// Normalize an image reference so a missing tag becomes `:latest`
pub fn normalize_image_ref(image: &str) -> String {
    // A colon after the last slash is a tag separator; otherwise any colon
    // belongs to a registry port.
    let after_slash = image.rsplit('/').next().unwrap_or(image);
    if after_slash.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

fn parse_port(service: &str, port: &PortConfig) -> Result<PortMapping> {
    match port {
        PortConfig::Long(long) => Ok(PortMapping {
            host_ip: long.host_ip.clone().unwrap_or_default(),
            host_port: long.published.clone().unwrap_or_default(),
            container_port: long.target,
            protocol: long.protocol.clone().unwrap_or_else(|| "tcp".to_string()),
        }),
        PortConfig::Short(short) => {
            let (spec, protocol) = match short.split_once('/') {
                Some((spec, proto)) => (spec, proto.to_string()),
                None => (short.as_str(), "tcp".to_string()),
            };

            let parts: Vec<&str> = spec.split(':').collect();
            let (host_ip, host_port, container) = match parts.as_slice() {
                [container] => ("", "", *container),
                [host, container] => ("", *host, *container),
                [ip, host, container] => (*ip, *host, *container),
                _ => {
                    return Err(KilnError::InvalidProject(format!(
                        "service {} has invalid port mapping {}",
                        service, short
                    )))
                }
            };

            let container_port = container.parse().map_err(|_| {
                KilnError::InvalidProject(format!(
                    "service {} has invalid port mapping {}",
                    service, short
                ))
            })?;

            Ok(PortMapping {
                host_ip: host_ip.to_string(),
                host_port: host_port.to_string(),
                container_port,
                protocol,
            })
        }
    }
}

fn parse_volume(service: &str, vol: &VolumeMount) -> Result<ServiceVolume> {
    match vol {
        VolumeMount::Long(long) => Ok(ServiceVolume {
            source: long.source.clone().unwrap_or_default(),
            target: long.target.clone(),
        }),
        VolumeMount::Short(short) => {
            let parts: Vec<&str> = short.split(':').collect();
            match parts.as_slice() {
                [source, target] | [source, target, _] => Ok(ServiceVolume {
                    source: source.to_string(),
                    target: target.to_string(),
                }),
                _ => Err(KilnError::InvalidProject(format!(
                    "service {} has invalid volume mount {}",
                    service, short
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::ComposeParser;

    fn project_from_yaml(yaml: &str) -> Result<Project> {
        let config = ComposeParser::parse_str(yaml).unwrap();
        Project::from_config(config, Path::new("/tmp/demo"), Path::new("compose.yaml"))
    }

    #[test]
    fn test_validate_defaults() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
"#,
        )
        .unwrap();

        assert_eq!(project.name, "demo");
        let web = project.service("web").unwrap();
        assert_eq!(web.container_name, "demo-web");
        assert!(web.platform.contains('/'));
        assert_eq!(web.image.as_deref(), Some("nginx:latest"));
    }

    #[test]
    fn test_validate_requires_image_or_build() {
        let result = project_from_yaml(
            r#"
services:
  web:
    hostname: lonely
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_unknown_network() {
        let result = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    networks:
      - missing
"#,
        );
        assert!(matches!(
            result,
            Err(KilnError::ReferencesUnknownNetwork { .. })
        ));
    }

    #[test]
    fn test_normalize_image_ref() {
        assert_eq!(normalize_image_ref("nginx"), "nginx:latest");
        assert_eq!(normalize_image_ref("nginx:1.25"), "nginx:1.25");
        assert_eq!(
            normalize_image_ref("registry.io:5000/app"),
            "registry.io:5000/app:latest"
        );
    }

    #[test]
    fn test_parse_short_ports() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    ports:
      - "8080:80"
      - "127.0.0.1:8443:443/udp"
"#,
        )
        .unwrap();

        let web = project.service("web").unwrap();
        assert_eq!(
            web.ports[0],
            PortMapping {
                host_ip: "".to_string(),
                host_port: "8080".to_string(),
                container_port: 80,
                protocol: "tcp".to_string(),
            }
        );
        assert_eq!(
            web.ports[1],
            PortMapping {
                host_ip: "127.0.0.1".to_string(),
                host_port: "8443".to_string(),
                container_port: 443,
                protocol: "udp".to_string(),
            }
        );
    }

    #[test]
    fn test_memory_from_deploy() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    deploy:
      resources:
        limits:
          memory: 256m
"#,
        )
        .unwrap();

        let web = project.service("web").unwrap();
        assert_eq!(web.memory_bytes(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_mem_limit_precedence() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    mem_reservation: 64m
"#,
        )
        .unwrap();

        let web = project.service("web").unwrap();
        assert_eq!(web.mem_limit, 0);
        assert_eq!(web.memory_bytes(), 64 * 1024 * 1024);
    }
}
