//! Per-network IPv4 address assignment
//!
//! Every non-external network with a subnet gets a reserved set seeded with
//! the network address, the gateway (defaulted to the subnet base when
//! absent) and any static addresses declared by services. Remaining
//! service attachments are then assigned the first free address scanning
//! upward from the subnet base. Assignment runs concurrently over services;
//! the reserved set sits behind a single mutex and an address is inserted
//! before the guard is released so two services can never pick the same one.

use super::project::Project;
use crate::error::{KilnError, Result};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// An IPv4 subnet in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    /// The address as written in the config
    base: Ipv4Addr,
    /// Prefix length, 1..=32
    prefix: u8,
}

impl Subnet {
    /// Parse `a.b.c.d/len`. Fails on malformed input and on a zero mask.
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let base: Ipv4Addr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        if prefix == 0 || prefix > 32 {
            return None;
        }
        Some(Self { base, prefix })
    }

    fn mask(&self) -> u32 {
        u32::MAX << (32 - self.prefix)
    }

    /// The network address (base with host bits cleared)
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) & self.mask())
    }

    /// The base address as written
    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    /// Whether the address lies inside the subnet
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }
}

/// Increment an IPv4 address in place, carrying across octets
pub fn increase_ip(ip: Ipv4Addr) -> Ipv4Addr {
    let mut octets = ip.octets();
    for i in (0..4).rev() {
        octets[i] = octets[i].wrapping_add(1);
        if octets[i] != 0 {
            break;
        }
    }
    Ipv4Addr::from(octets)
}

/// Assign IPv4 addresses to every service network attachment that lacks one.
///
/// Gateways are defaulted and verified as a side effect; the project's
/// networks and services are updated in place.
pub async fn assign_ips(project: &mut Project) -> Result<()> {
    let mut subnets: HashMap<String, Subnet> = HashMap::new();
    let mut reserved: HashMap<String, HashSet<Ipv4Addr>> = HashMap::new();

    for (name, network) in project.networks.iter_mut() {
        if network.external {
            continue;
        }

        let Some(subnet_str) = network.subnet.as_deref() else {
            continue;
        };

        let subnet = Subnet::parse(subnet_str)
            .ok_or_else(|| KilnError::InvalidSubnet(network.name.clone()))?;

        let gateway = match network.gateway.as_deref() {
            None | Some("") => {
                let gw = subnet.base();
                network.gateway = Some(gw.to_string());
                gw
            }
            Some(gw) => {
                let gw: Ipv4Addr = gw
                    .parse()
                    .map_err(|_| KilnError::InvalidSubnet(network.name.clone()))?;
                if !subnet.contains(gw) {
                    return Err(KilnError::InvalidSubnet(network.name.clone()));
                }
                gw
            }
        };

        let set = reserved.entry(name.clone()).or_default();
        set.insert(gateway);
        set.insert(subnet.network());
        subnets.insert(name.clone(), subnet);
    }

    // Static addresses declared by services are reserved up front.
    for service in &project.services {
        for (name, attachment) in &service.networks {
            if !project.networks.contains_key(name) {
                return Err(KilnError::ReferencesUnknownNetwork {
                    service: service.name.clone(),
                    network: name.clone(),
                });
            }

            if let Some(addr) = attachment.ipv4_address.as_deref() {
                if !subnets.contains_key(name) {
                    return Err(KilnError::InvalidSubnet(name.clone()));
                }
                let ip: Ipv4Addr = addr
                    .parse()
                    .map_err(|_| KilnError::InvalidSubnet(name.clone()))?;
                reserved.entry(name.clone()).or_default().insert(ip);
            }
        }
    }

    let subnets = Arc::new(subnets);
    let reserved = Arc::new(Mutex::new(reserved));

    let mut tasks = tokio::task::JoinSet::new();
    for (index, service) in project.services.iter().enumerate() {
        let wanted: Vec<String> = service
            .networks
            .iter()
            .filter(|(name, attachment)| {
                attachment.ipv4_address.is_none() && subnets.contains_key(name.as_str())
            })
            .map(|(name, _)| name.clone())
            .collect();

        if wanted.is_empty() {
            continue;
        }

        let subnets = Arc::clone(&subnets);
        let reserved = Arc::clone(&reserved);
        tasks.spawn(async move {
            let mut assigned: Vec<(String, Ipv4Addr)> = Vec::with_capacity(wanted.len());
            for name in wanted {
                let subnet = subnets[&name];

                let mut guard = reserved
                    .lock()
                    .map_err(|_| KilnError::Lock("reserved address map poisoned".to_string()))?;
                let used = guard.entry(name.clone()).or_default();

                let mut ip = subnet.base();
                while subnet.contains(ip) && used.contains(&ip) {
                    ip = increase_ip(ip);
                }

                if !subnet.contains(ip) {
                    return Err(KilnError::SubnetExhausted(name));
                }

                // Reserve before the guard drops.
                used.insert(ip);
                drop(guard);

                assigned.push((name, ip));
            }
            Ok((index, assigned))
        });
    }

    while let Some(result) = tasks.join_next().await {
        let (index, assigned) = result
            .map_err(|e| KilnError::Internal(format!("assignment task panicked: {}", e)))??;
        for (name, ip) in assigned {
            if let Some(attachment) = project.services[index].networks.get_mut(&name) {
                attachment.ipv4_address = Some(ip.to_string());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::ComposeParser;
    use std::path::Path;

    fn project_from_yaml(yaml: &str) -> Project {
        let config = ComposeParser::parse_str(yaml).unwrap();
        Project::from_config(config, Path::new("/tmp/demo"), Path::new("compose.yaml")).unwrap()
    }

    #[test]
    fn test_subnet_parse() {
        let subnet = Subnet::parse("10.0.0.0/24").unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert!(subnet.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 0, 1, 0)));

        assert!(Subnet::parse("10.0.0.0/0").is_none());
        assert!(Subnet::parse("10.0.0.0/33").is_none());
        assert!(Subnet::parse("10.0.0.0").is_none());
        assert!(Subnet::parse("banana/8").is_none());
    }

    #[test]
    fn test_increase_ip_carries() {
        assert_eq!(
            increase_ip(Ipv4Addr::new(10, 0, 0, 255)),
            Ipv4Addr::new(10, 0, 1, 0)
        );
        assert_eq!(
            increase_ip(Ipv4Addr::new(10, 255, 255, 255)),
            Ipv4Addr::new(11, 0, 0, 0)
        );
    }

    #[tokio::test]
    async fn test_assign_small_subnet() {
        let mut project = project_from_yaml(
            r#"
services:
  api:
    image: api
    networks:
      - backend
  web:
    image: web
    networks:
      - backend
networks:
  backend:
    ipam:
      config:
        - subnet: 10.0.0.0/30
"#,
        );

        assign_ips(&mut project).await.unwrap();

        // .0 is both network address and defaulted gateway; the two
        // services receive .1 and .2 in name order.
        assert_eq!(
            project.networks["backend"].gateway.as_deref(),
            Some("10.0.0.0")
        );
        let mut addrs: Vec<String> = project
            .services
            .iter()
            .map(|s| s.networks["backend"].ipv4_address.clone().unwrap())
            .collect();
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_assign_exhausted() {
        let mut project = project_from_yaml(
            r#"
services:
  api:
    image: api
    networks:
      - backend
  web:
    image: web
    networks:
      - backend
networks:
  backend:
    ipam:
      config:
        - subnet: 10.0.0.0/31
"#,
        );

        // Only .1 is free, so one of the two services must fail.
        let result = assign_ips(&mut project).await;
        assert!(matches!(result, Err(KilnError::SubnetExhausted(_))));
    }

    #[tokio::test]
    async fn test_static_address_reserved() {
        let mut project = project_from_yaml(
            r#"
services:
  api:
    image: api
    networks:
      backend:
        ipv4_address: 10.0.0.1
  web:
    image: web
    networks:
      - backend
networks:
  backend:
    ipam:
      config:
        - subnet: 10.0.0.0/24
"#,
        );

        assign_ips(&mut project).await.unwrap();

        let web = project.service("web").unwrap();
        assert_eq!(
            web.networks["backend"].ipv4_address.as_deref(),
            Some("10.0.0.2")
        );
    }

    #[tokio::test]
    async fn test_gateway_outside_subnet() {
        let mut project = project_from_yaml(
            r#"
services:
  web:
    image: web
    networks:
      - backend
networks:
  backend:
    ipam:
      config:
        - subnet: 10.0.0.0/24
          gateway: 192.168.0.1
"#,
        );

        let result = assign_ips(&mut project).await;
        assert!(matches!(result, Err(KilnError::InvalidSubnet(_))));
    }

    #[tokio::test]
    async fn test_explicit_gateway_reserved() {
        let mut project = project_from_yaml(
            r#"
services:
  web:
    image: web
    networks:
      - backend
networks:
  backend:
    ipam:
      config:
        - subnet: 10.0.0.0/24
          gateway: 10.0.0.1
"#,
        );

        assign_ips(&mut project).await.unwrap();

        let web = project.service("web").unwrap();
        // .0 network and .1 gateway are reserved.
        assert_eq!(
            web.networks["backend"].ipv4_address.as_deref(),
            Some("10.0.0.2")
        );
    }

    #[tokio::test]
    async fn test_network_without_subnet_skipped() {
        let mut project = project_from_yaml(
            r#"
services:
  web:
    image: web
    networks:
      - plain
networks:
  plain: {}
"#,
        );

        assign_ips(&mut project).await.unwrap();
        let web = project.service("web").unwrap();
        assert!(web.networks["plain"].ipv4_address.is_none());
    }
}
