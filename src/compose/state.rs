//! Embedded project state
//!
//! Every orchestrator operation records which machines, networks and
//! volumes belong to a project, keyed by stable names rather than
//! back-pointers. The snapshot is reconciled against the platform's live
//! lists on each run and written back even when the run fails.

use crate::error::{KilnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// A by-name reference to an owned object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name
    pub name: String,
}

impl ObjectMeta {
    /// Create a reference from a name
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// Recorded state of a project between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedProject {
    /// Project name
    pub name: String,
    /// Compose file the project was loaded from
    pub composefile: PathBuf,
    /// Project working directory
    pub workdir: PathBuf,
    /// Machines owned by the project
    #[serde(default)]
    pub machines: Vec<ObjectMeta>,
    /// Networks owned by the project
    #[serde(default)]
    pub networks: Vec<ObjectMeta>,
    /// Volumes owned by the project
    #[serde(default)]
    pub volumes: Vec<ObjectMeta>,
    /// Last write timestamp
    pub updated_at: DateTime<Utc>,
}

impl EmbeddedProject {
    /// Add a machine reference, ignoring duplicates
    pub fn add_machine(&mut self, name: &str) {
        if !self.machines.iter().any(|m| m.name == name) {
            self.machines.push(ObjectMeta::named(name));
        }
    }

    /// Drop a machine reference
    pub fn remove_machine(&mut self, name: &str) {
        self.machines.retain(|m| m.name != name);
    }

    /// Add a network reference, ignoring duplicates
    pub fn add_network(&mut self, name: &str) {
        if !self.networks.iter().any(|n| n.name == name) {
            self.networks.push(ObjectMeta::named(name));
        }
    }

    /// Add a volume reference, ignoring duplicates
    pub fn add_volume(&mut self, name: &str) {
        if !self.volumes.iter().any(|v| v.name == name) {
            self.volumes.push(ObjectMeta::named(name));
        }
    }
}

/// Directory-backed store of embedded project state
pub struct ProjectStore {
    state_dir: PathBuf,
}

impl ProjectStore {
    /// Create the store under the state directory
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("projects");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { state_dir: dir })
    }

    fn project_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", name))
    }

    /// Load recorded state for a project
    pub async fn get(&self, name: &str) -> Result<Option<EmbeddedProject>> {
        let path = self.project_path(name);
        match fs::read(&path).await {
            Ok(raw) => {
                let project = serde_json::from_slice(&raw).map_err(|e| {
                    KilnError::Internal(format!(
                        "corrupt project record {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(project))
            }
            Err(_) => Ok(None),
        }
    }

    /// Write recorded state for a project
    pub async fn update(&self, mut project: EmbeddedProject) -> Result<()> {
        project.updated_at = Utc::now();
        let path = self.project_path(&project.name);
        fs::write(&path, serde_json::to_vec_pretty(&project)?).await?;
        Ok(())
    }

    /// Remove recorded state for a project
    pub async fn remove(&self, name: &str) -> Result<()> {
        let path = self.project_path(name);
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}
