//! Volume service
//!
//! Name-keyed registry of machine volumes with a directory per volume
//! under the state directory. External volumes declared in a project are
//! never created or removed here.

use crate::error::{KilnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A created machine volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineVolume {
    /// Volume name
    pub name: String,
    /// Driver name
    pub driver: String,
    /// Backing directory on the host
    pub mountpoint: PathBuf,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Volume registry
pub struct VolumeService {
    state_dir: PathBuf,
    volumes: Arc<RwLock<HashMap<String, MachineVolume>>>,
}

impl VolumeService {
    /// Create the service, loading recorded volumes
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("volumes");
        std::fs::create_dir_all(&dir)?;

        let mut volumes = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let manifest = entry.path().join("volume.json");
            if !manifest.exists() {
                continue;
            }
            let raw = std::fs::read(&manifest)?;
            if let Ok(volume) = serde_json::from_slice::<MachineVolume>(&raw) {
                volumes.insert(volume.name.clone(), volume);
            }
        }

        Ok(Self {
            state_dir: dir,
            volumes: Arc::new(RwLock::new(volumes)),
        })
    }

    /// Create a volume. Creating an existing volume with the same driver
    /// is a no-op; a different driver is an error.
    pub fn create(&self, name: &str, driver: &str) -> Result<MachineVolume> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| KilnError::Lock("volume registry poisoned".to_string()))?;

        if let Some(existing) = volumes.get(name) {
            if existing.driver != driver {
                return Err(KilnError::Volume(format!(
                    "volume {} already exists with driver {}",
                    name, existing.driver
                )));
            }
            return Ok(existing.clone());
        }

        let dir = self.state_dir.join(name);
        std::fs::create_dir_all(dir.join("data"))?;

        let volume = MachineVolume {
            name: name.to_string(),
            driver: driver.to_string(),
            mountpoint: dir.join("data"),
            created_at: Utc::now(),
        };

        std::fs::write(dir.join("volume.json"), serde_json::to_vec_pretty(&volume)?)?;
        volumes.insert(name.to_string(), volume.clone());

        tracing::info!(volume = %name, driver = %driver, "created volume");
        Ok(volume)
    }

    /// Look up a volume by name
    pub fn get(&self, name: &str) -> Result<Option<MachineVolume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| KilnError::Lock("volume registry poisoned".to_string()))?;
        Ok(volumes.get(name).cloned())
    }

    /// List all volumes
    pub fn list(&self) -> Result<Vec<MachineVolume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| KilnError::Lock("volume registry poisoned".to_string()))?;
        let mut list: Vec<MachineVolume> = volumes.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Remove a volume and its backing directory
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| KilnError::Lock("volume registry poisoned".to_string()))?;
        volumes
            .remove(name)
            .ok_or_else(|| KilnError::VolumeNotFound(name.to_string()))?;

        let dir = self.state_dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }

        tracing::info!(volume = %name, "removed volume");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_is_idempotent_for_same_driver() {
        let temp = tempdir().unwrap();
        let service = VolumeService::new(temp.path()).unwrap();

        let first = service.create("data", "local").unwrap();
        let second = service.create("data", "local").unwrap();
        assert_eq!(first.mountpoint, second.mountpoint);
        assert!(first.mountpoint.exists());
    }

    #[test]
    fn test_create_with_different_driver_rejected() {
        let temp = tempdir().unwrap();
        let service = VolumeService::new(temp.path()).unwrap();

        service.create("data", "local").unwrap();
        let result = service.create("data", "nfs");
        assert!(matches!(result, Err(KilnError::Volume(_))));
    }

    #[test]
    fn test_remove_deletes_backing_dir() {
        let temp = tempdir().unwrap();
        let service = VolumeService::new(temp.path()).unwrap();

        let volume = service.create("data", "local").unwrap();
        service.remove("data").unwrap();
        assert!(!volume.mountpoint.exists());
        assert!(service.get("data").unwrap().is_none());
    }
}
