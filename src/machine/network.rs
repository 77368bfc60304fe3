//! Network service
//!
//! Name-keyed registry of machine networks persisted under the state
//! directory. External networks declared in a project are never created
//! or removed here.

use crate::error::{KilnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A created machine network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineNetwork {
    /// Network name
    pub name: String,
    /// Driver name
    pub driver: String,
    /// Subnet in CIDR form
    pub subnet: Option<String>,
    /// Gateway address
    pub gateway: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Network registry
pub struct NetworkService {
    state_dir: PathBuf,
    networks: Arc<RwLock<HashMap<String, MachineNetwork>>>,
}

impl NetworkService {
    /// Create the service, loading recorded networks
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("networks");
        std::fs::create_dir_all(&dir)?;

        let mut networks = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(entry.path())?;
            if let Ok(network) = serde_json::from_slice::<MachineNetwork>(&raw) {
                networks.insert(network.name.clone(), network);
            }
        }

        Ok(Self {
            state_dir: dir,
            networks: Arc::new(RwLock::new(networks)),
        })
    }

    fn network_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", name))
    }

    /// Create a network; creating an existing one is an error
    pub fn create(
        &self,
        name: &str,
        driver: &str,
        subnet: Option<&str>,
        gateway: Option<&str>,
    ) -> Result<MachineNetwork> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| KilnError::Lock("network registry poisoned".to_string()))?;

        if networks.contains_key(name) {
            return Err(KilnError::Network(format!(
                "network {} already exists",
                name
            )));
        }

        let network = MachineNetwork {
            name: name.to_string(),
            driver: driver.to_string(),
            subnet: subnet.map(str::to_string),
            gateway: gateway.map(str::to_string),
            created_at: Utc::now(),
        };

        std::fs::write(
            self.network_path(name),
            serde_json::to_vec_pretty(&network)?,
        )?;
        networks.insert(name.to_string(), network.clone());

        tracing::info!(network = %name, driver = %driver, "created network");
        Ok(network)
    }

    /// Look up a network by name
    pub fn get(&self, name: &str) -> Result<Option<MachineNetwork>> {
        let networks = self
            .networks
            .read()
            .map_err(|_| KilnError::Lock("network registry poisoned".to_string()))?;
        Ok(networks.get(name).cloned())
    }

    /// List all networks
    pub fn list(&self) -> Result<Vec<MachineNetwork>> {
        let networks = self
            .networks
            .read()
            .map_err(|_| KilnError::Lock("network registry poisoned".to_string()))?;
        let mut list: Vec<MachineNetwork> = networks.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Remove a network
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| KilnError::Lock("network registry poisoned".to_string()))?;
        networks
            .remove(name)
            .ok_or_else(|| KilnError::NetworkNotFound(name.to_string()))?;

        let path = self.network_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        tracing::info!(network = %name, "removed network");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_list_remove() {
        let temp = tempdir().unwrap();
        let service = NetworkService::new(temp.path()).unwrap();

        service
            .create("backend", "bridge", Some("10.1.0.0/24"), Some("10.1.0.1"))
            .unwrap();

        assert!(service.get("backend").unwrap().is_some());
        assert_eq!(service.list().unwrap().len(), 1);

        assert!(service
            .create("backend", "bridge", None, None)
            .is_err());

        service.remove("backend").unwrap();
        assert!(service.get("backend").unwrap().is_none());
    }

    #[test]
    fn test_networks_survive_reload() {
        let temp = tempdir().unwrap();
        {
            let service = NetworkService::new(temp.path()).unwrap();
            service.create("backend", "bridge", None, None).unwrap();
        }

        let service = NetworkService::new(temp.path()).unwrap();
        assert!(service.get("backend").unwrap().is_some());
    }
}
