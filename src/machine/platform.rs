//! Machine platform back-ends
//!
//! `LocalPlatform` drives unikernels as QEMU subprocesses with machine
//! specs persisted under a state directory, so machines survive the CLI
//! process. `PlatformIterator` merges several named platforms behind the
//! `MachinePlatform` capability.

use super::{Machine, MachinePlatform, MachineSpec, MachineState};
use crate::error::{KilnError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use tokio::process::Command;
use uuid::Uuid;

/// Default memory for machines without a limit, 64 MiB
pub const DEFAULT_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// QEMU-backed local platform
pub struct LocalPlatform {
    name: String,
    state_dir: PathBuf,
    machines: Arc<RwLock<HashMap<String, Machine>>>,
}

impl LocalPlatform {
    /// Create the platform, loading any machines recorded under the state
    /// directory.
    pub fn new(name: &str, state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("machines");
        std::fs::create_dir_all(&dir)?;

        let mut machines = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let manifest = entry.path().join("machine.json");
            if !manifest.exists() {
                continue;
            }

            let raw = std::fs::read(&manifest)?;
            match serde_json::from_slice::<Machine>(&raw) {
                Ok(mut machine) => {
                    // A recorded running machine whose process is gone has
                    // exited while we were away.
                    if machine.state == MachineState::Running && !pid_alive(machine.pid) {
                        machine.state = MachineState::Exited;
                        machine.pid = None;
                    }
                    machines.insert(machine.spec.name.clone(), machine);
                }
                Err(e) => {
                    tracing::warn!(path = %manifest.display(), error = %e, "skipping unreadable machine record");
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            state_dir: dir,
            machines: Arc::new(RwLock::new(machines)),
        })
    }

    fn machine_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    fn persist(&self, machine: &Machine) -> Result<()> {
        let dir = self.machine_dir(&machine.spec.name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("machine.json"),
            serde_json::to_vec_pretty(machine)?,
        )?;
        Ok(())
    }

    fn with_machine<F>(&self, name: &str, f: F) -> Result<Machine>
    where
        F: FnOnce(&mut Machine) -> Result<()>,
    {
        let mut machines = self
            .machines
            .write()
            .map_err(|_| KilnError::Lock("machine registry poisoned".to_string()))?;
        let machine = machines
            .get_mut(name)
            .ok_or_else(|| KilnError::MachineNotFound(name.to_string()))?;
        f(machine)?;
        let snapshot = machine.clone();
        drop(machines);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    fn qemu_command(&self, machine: &Machine) -> Command {
        let spec = &machine.spec;
        let memory = if spec.memory_bytes > 0 {
            spec.memory_bytes
        } else {
            DEFAULT_MEMORY_BYTES
        };

        let mut cmd = Command::new(format!("qemu-system-{}", spec.arch));
        cmd.arg("-nographic")
            .arg("-nodefaults")
            .arg("-no-reboot")
            .arg("-m")
            .arg(format!("{}M", memory / (1024 * 1024)))
            .arg("-kernel")
            .arg(&spec.kernel);

        if let Some(initrd) = &spec.initrd {
            cmd.arg("-initrd").arg(initrd);
        }

        let mut append = Vec::new();
        for (i, network) in spec.networks.iter().enumerate() {
            append.push(format!("netdev.ip{}={}", i, network));
        }
        for env in &spec.env {
            append.push(format!("env.vars.{}", env));
        }
        append.push("--".to_string());
        append.extend(spec.args.iter().cloned());
        cmd.arg("-append").arg(append.join(" "));

        if !spec.ports.is_empty() {
            let mut netdev = String::from("user,id=net0");
            for port in &spec.ports {
                // <host-ip>:<host-port>:<container-port>/<proto>
                let (front, proto) = port.split_once('/').unwrap_or((port.as_str(), "tcp"));
                let parts: Vec<&str> = front.split(':').collect();
                if let [host_ip, host_port, container_port] = parts.as_slice() {
                    netdev.push_str(&format!(
                        ",hostfwd={}:{}:{}-:{}",
                        proto, host_ip, host_port, container_port
                    ));
                }
            }
            cmd.arg("-netdev")
                .arg(netdev)
                .arg("-device")
                .arg("virtio-net-pci,netdev=net0");
        }

        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl MachinePlatform for LocalPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, spec: MachineSpec) -> Result<Machine> {
        let mut machines = self
            .machines
            .write()
            .map_err(|_| KilnError::Lock("machine registry poisoned".to_string()))?;

        if machines.contains_key(&spec.name) {
            return Err(KilnError::Machine(format!(
                "machine {} already exists",
                spec.name
            )));
        }

        let machine = Machine {
            id: Uuid::new_v4().to_string().replace('-', "")[..12].to_string(),
            spec,
            state: MachineState::Created,
            created_at: Utc::now(),
            pid: None,
            exit_code: None,
        };

        machines.insert(machine.spec.name.clone(), machine.clone());
        drop(machines);

        self.persist(&machine)?;
        tracing::debug!(machine = %machine.spec.name, id = %machine.id, "created machine");
        Ok(machine)
    }

    async fn start(&self, name: &str) -> Result<()> {
        let machine = {
            let machines = self
                .machines
                .read()
                .map_err(|_| KilnError::Lock("machine registry poisoned".to_string()))?;
            machines
                .get(name)
                .cloned()
                .ok_or_else(|| KilnError::MachineNotFound(name.to_string()))?
        };

        match machine.state {
            MachineState::Created | MachineState::Exited => {}
            state => {
                return Err(KilnError::Machine(format!(
                    "machine {} cannot start from state {}",
                    name, state
                )))
            }
        }

        let child = self
            .qemu_command(&machine)
            .spawn()
            .map_err(|e| KilnError::Machine(format!("failed to start machine {}: {}", name, e)))?;

        let pid = child.id();
        self.with_machine(name, |m| {
            m.state = MachineState::Running;
            m.pid = pid;
            m.exit_code = None;
            Ok(())
        })?;

        tracing::info!(machine = %name, pid = ?pid, "started machine");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.with_machine(name, |machine| {
            if machine.state != MachineState::Running && machine.state != MachineState::Paused {
                return Ok(());
            }

            if let Some(pid) = machine.pid {
                signal(pid, libc::SIGTERM);
            }
            machine.state = MachineState::Exited;
            machine.pid = None;
            Ok(())
        })?;

        tracing::info!(machine = %name, "stopped machine");
        Ok(())
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.with_machine(name, |machine| {
            if machine.state != MachineState::Running {
                return Err(KilnError::Machine(format!(
                    "machine {} is not running",
                    name
                )));
            }
            if let Some(pid) = machine.pid {
                signal(pid, libc::SIGSTOP);
            }
            machine.state = MachineState::Paused;
            Ok(())
        })?;

        tracing::info!(machine = %name, "paused machine");
        Ok(())
    }

    async fn unpause(&self, name: &str) -> Result<()> {
        self.with_machine(name, |machine| {
            if machine.state != MachineState::Paused {
                return Err(KilnError::Machine(format!(
                    "machine {} is not paused",
                    name
                )));
            }
            if let Some(pid) = machine.pid {
                signal(pid, libc::SIGCONT);
            }
            machine.state = MachineState::Running;
            Ok(())
        })?;

        tracing::info!(machine = %name, "unpaused machine");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.stop(name).await?;

        let mut machines = self
            .machines
            .write()
            .map_err(|_| KilnError::Lock("machine registry poisoned".to_string()))?;
        machines
            .remove(name)
            .ok_or_else(|| KilnError::MachineNotFound(name.to_string()))?;
        drop(machines);

        let dir = self.machine_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        tracing::info!(machine = %name, "removed machine");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Machine>> {
        let machines = self
            .machines
            .read()
            .map_err(|_| KilnError::Lock("machine registry poisoned".to_string()))?;
        Ok(machines.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Machine>> {
        let machines = self
            .machines
            .read()
            .map_err(|_| KilnError::Lock("machine registry poisoned".to_string()))?;
        let mut list: Vec<Machine> = machines.values().cloned().collect();
        list.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        Ok(list)
    }
}

fn signal(pid: u32, sig: i32) {
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

fn pid_alive(pid: Option<u32>) -> bool {
    match pid {
        Some(pid) => unsafe { libc::kill(pid as i32, 0) == 0 },
        None => false,
    }
}

/// Merges several named platforms behind one `MachinePlatform` surface
pub struct PlatformIterator {
    platforms: Vec<Arc<dyn MachinePlatform>>,
}

impl PlatformIterator {
    /// Create an iterator over the given platforms
    pub fn new(platforms: Vec<Arc<dyn MachinePlatform>>) -> Self {
        Self { platforms }
    }

    /// The platform that owns the named machine
    async fn owner(&self, name: &str) -> Result<Arc<dyn MachinePlatform>> {
        for platform in &self.platforms {
            if platform.get(name).await?.is_some() {
                return Ok(Arc::clone(platform));
            }
        }
        Err(KilnError::MachineNotFound(name.to_string()))
    }

    /// The platform with the given name
    pub fn platform(&self, name: &str) -> Option<Arc<dyn MachinePlatform>> {
        self.platforms
            .iter()
            .find(|p| p.name() == name)
            .map(Arc::clone)
    }

    /// Create a machine on the platform named in the spec, falling back to
    /// the first platform.
    pub async fn create(&self, spec: MachineSpec) -> Result<Machine> {
        let platform = self
            .platform(&spec.platform)
            .or_else(|| self.platforms.first().map(Arc::clone))
            .ok_or_else(|| KilnError::Machine("no platforms registered".to_string()))?;
        platform.create(spec).await
    }

    /// Start a machine wherever it lives
    pub async fn start(&self, name: &str) -> Result<()> {
        self.owner(name).await?.start(name).await
    }

    /// Stop a machine wherever it lives
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.owner(name).await?.stop(name).await
    }

    /// Pause a machine wherever it lives
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.owner(name).await?.pause(name).await
    }

    /// Unpause a machine wherever it lives
    pub async fn unpause(&self, name: &str) -> Result<()> {
        self.owner(name).await?.unpause(name).await
    }

    /// Remove a machine wherever it lives
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.owner(name).await?.remove(name).await
    }

    /// Look up a machine across all platforms
    pub async fn get(&self, name: &str) -> Result<Option<Machine>> {
        for platform in &self.platforms {
            if let Some(machine) = platform.get(name).await? {
                return Ok(Some(machine));
            }
        }
        Ok(None)
    }

    /// List machines across all platforms
    pub async fn list(&self) -> Result<Vec<Machine>> {
        let mut all = Vec::new();
        for platform in &self.platforms {
            all.extend(platform.list().await?);
        }
        Ok(all)
    }
}
