//! Compose orchestrator
//!
//! Drives a validated project end to end: address assignment, dependency
//! ordering, per-service initrd builds and OCI packaging, and machine
//! lifecycle against the platform layer. Build and lifecycle phases run
//! under the progress tree; a failing service is logged and the rest of
//! the graph is still attempted, while allocation and network failures
//! abort the run.

use super::graph::{ordered_by_dependencies, reversed_by_dependencies};
use super::ipam::assign_ips;
use super::parser::ComposeParser;
use super::project::{Project, Service};
use super::state::{EmbeddedProject, ObjectMeta, ProjectStore};
use crate::error::{KilnError, Result};
use crate::initrd::{DockerfileInitrd, Initrd, InitrdOptions};
use crate::machine::platform::LocalPlatform;
use crate::machine::{
    MachineSpec, MachineState, NetworkService, PlatformIterator, VolumeService,
};
use crate::oci::{
    DirectoryHandler, Manifest, StorageHandler, ANNOTATION_INITRD_PATH, ANNOTATION_KERNEL_PATH,
};
use crate::tui::{ProcessTree, ProcessTreeItem, ProcessTreeOptions};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Remote package catalog, consulted when an image is not available
/// locally. Pulling stores the artifact into the local OCI store and
/// returns its manifest digest.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Pull an image for the given platform and architecture
    async fn pull(&self, image: &str, plat: &str, arch: &str) -> Result<Option<String>>;
}

/// A runnable artifact recovered from a packaged image or a fresh build
#[derive(Debug, Clone)]
struct RunnableArtifact {
    kernel: PathBuf,
    initrd: Option<PathBuf>,
    args: Vec<String>,
    env: Vec<String>,
}

/// Options common to all orchestrator operations
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Explicit compose file, otherwise the default names are tried
    pub compose_file: Option<String>,
    /// Kernel image packaged into built artifacts
    pub kernel: Option<PathBuf>,
    /// Remove machines, networks and volumes no longer declared
    pub remove_orphans: bool,
    /// Build arguments forwarded to Dockerfile builds
    pub build_args: Vec<String>,
    /// Multi-stage build target
    pub build_target: Option<String>,
    /// Build secrets forwarded to Dockerfile builds
    pub build_secrets: Vec<String>,
    /// Disable the live progress renderer
    pub no_render: bool,
}

/// Compose orchestrator
pub struct ComposeOrchestrator {
    workdir: PathBuf,
    state_dir: PathBuf,
    opts: OrchestratorOptions,
    platforms: Arc<PlatformIterator>,
    networks: Arc<NetworkService>,
    volumes: Arc<VolumeService>,
    store: Arc<ProjectStore>,
    oci: Arc<DirectoryHandler>,
    remote: Option<Arc<dyn RemoteCatalog>>,
}

impl ComposeOrchestrator {
    /// Create an orchestrator rooted in a working directory, with all
    /// state kept under the state directory.
    pub fn new(workdir: &Path, state_dir: &Path, opts: OrchestratorOptions) -> Result<Self> {
        let local: Arc<dyn crate::machine::MachinePlatform> =
            Arc::new(LocalPlatform::new("qemu", state_dir)?);

        Ok(Self {
            workdir: workdir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            opts,
            platforms: Arc::new(PlatformIterator::new(vec![local])),
            networks: Arc::new(NetworkService::new(state_dir)?),
            volumes: Arc::new(VolumeService::new(state_dir)?),
            store: Arc::new(ProjectStore::new(state_dir)?),
            oci: Arc::new(DirectoryHandler::new(&state_dir.join("oci"))?),
            remote: None,
        })
    }

    /// Attach a remote catalog used to pull packaged images
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCatalog>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Load, validate and normalize the project
    pub fn load_project(&self) -> Result<Project> {
        let compose_file =
            ComposeParser::resolve_compose_file(&self.workdir, self.opts.compose_file.as_deref())?;
        tracing::debug!(composefile = %compose_file.display(), "using");

        let mut config = ComposeParser::parse_file(&compose_file)?;
        let env: HashMap<String, String> = std::env::vars().collect();
        ComposeParser::interpolate(&mut config, &env);

        Project::from_config(config, &self.workdir, &compose_file)
    }

    /// Create and start the project
    pub async fn up(&self, services: &[String]) -> Result<()> {
        self.create(services).await?;
        self.start(services).await
    }

    /// Create the networks, volumes and machines for the project
    pub async fn create(&self, services: &[String]) -> Result<()> {
        let mut project = self.load_project()?;
        assign_ips(&mut project).await?;

        if self.opts.remove_orphans {
            self.remove_orphans(&project).await?;
        }

        let mut embedded = self.embedded(&project).await?;
        let result = self
            .create_inner(&project, services, &mut embedded)
            .await;

        // Recorded state is written back regardless of how the run went.
        if let Err(e) = self.store.update(embedded).await {
            tracing::error!(error = %e, "failed to update project record");
        }

        result
    }

    async fn create_inner(
        &self,
        project: &Project,
        services: &[String],
        embedded: &mut EmbeddedProject,
    ) -> Result<()> {
        // Networks with an explicit subnet come up before the rest, and
        // all networks before volumes.
        let mut with_subnet = Vec::new();
        let mut without_subnet = Vec::new();
        for network in project.networks.values() {
            if network.external {
                continue;
            }
            if network.subnet.is_some() {
                with_subnet.push(network);
            } else {
                without_subnet.push(network);
            }
        }

        for network in with_subnet.into_iter().chain(without_subnet) {
            if self.networks.get(&network.name)?.is_some() {
                continue;
            }

            tracing::info!(network = %network.name, "creating network");
            self.networks.create(
                &network.name,
                &network.driver,
                network.subnet.as_deref(),
                network.gateway.as_deref(),
            )?;
            embedded.add_network(&network.name);
        }

        for volume in project.volumes.values() {
            if volume.external {
                continue;
            }
            if self.volumes.get(&volume.name)?.is_some() {
                continue;
            }

            tracing::info!(volume = %volume.name, "creating volume");
            self.volumes.create(&volume.name, &volume.driver)?;
            embedded.add_volume(&volume.name);
        }

        let selected = project.get_services(services)?;
        let ordered = ordered_by_dependencies(project, &selected, true)?;

        for service in &ordered {
            tracing::debug!(service = %service.name, "creating service");

            if let Some(machine) = self.platforms.get(&service.container_name).await? {
                match machine.state {
                    MachineState::Running | MachineState::Created => continue,
                    _ => {
                        // A stopped machine is removed so the create below
                        // starts from a clean slate.
                        self.platforms.remove(&service.container_name).await?;
                        embedded.remove_machine(&service.container_name);
                    }
                }
            }

            let artifact = if service.image.is_none() {
                self.build_artifact(project, service).await
            } else {
                self.ensure_packaged(project, service).await
            };

            let created = match artifact {
                Ok(artifact) => self.create_machine(project, service, artifact).await,
                Err(e) => Err(e),
            };

            match created {
                Ok(()) => embedded.add_machine(&service.container_name),
                Err(e) => {
                    tracing::error!(service = %service.name, error = %e, "failed to create service");
                }
            }
        }

        Ok(())
    }

    /// Build (and, for named images, package) every service with a build
    /// context, concurrently under the progress tree.
    pub async fn build(&self, services: &[String]) -> Result<()> {
        let project = self.load_project()?;
        let selected = project.get_services(services)?;

        let mut items = Vec::new();
        for service in &selected {
            if service.build.is_none() {
                continue;
            }

            let this = self.clone_refs();
            let project = project.clone();
            let service = service.clone();
            let label = format!("building {}", service.name);
            let service_name = service.name.clone();

            items.push(ProcessTreeItem::new(&label, &service_name, move |_ctx| {
                async move {
                    let artifact = this.build_artifact(&project, &service).await?;
                    if service.image.is_some() {
                        this.package_artifact(&project, &service, &artifact).await?;
                    }
                    Ok(())
                }
            }));
        }

        if items.is_empty() {
            return Ok(());
        }

        let tree = ProcessTree::new(
            ProcessTreeOptions {
                parallel: true,
                fail_fast: true,
                norender: self.opts.no_render,
                ..Default::default()
            },
            items,
        )?;
        tree.start().await
    }

    /// Start created machines in dependency order
    pub async fn start(&self, services: &[String]) -> Result<()> {
        let project = self.load_project()?;
        let selected = project.get_services(services)?;
        let ordered = ordered_by_dependencies(&project, &selected, true)?;

        let mut to_start = Vec::new();
        for service in &ordered {
            if let Some(machine) = self.platforms.get(&service.container_name).await? {
                if machine.state == MachineState::Created || machine.state == MachineState::Exited
                {
                    to_start.push(service.container_name.clone());
                }
            }
        }

        self.lifecycle_tree("starting", to_start, |platforms, name| async move {
            platforms.start(&name).await
        })
        .await
    }

    /// Stop running machines in reverse dependency order
    pub async fn stop(&self, services: &[String]) -> Result<()> {
        let project = self.load_project()?;
        let selected = project.get_services(services)?;
        let reversed = reversed_by_dependencies(&project, &selected, false)?;

        let mut to_stop = Vec::new();
        for service in &reversed {
            if let Some(machine) = self.platforms.get(&service.container_name).await? {
                if machine.state == MachineState::Running || machine.state == MachineState::Paused
                {
                    to_stop.push(service.container_name.clone());
                }
            }
        }

        self.lifecycle_tree("stopping", to_stop, |platforms, name| async move {
            platforms.stop(&name).await
        })
        .await
    }

    /// Pause running machines in reverse dependency order
    pub async fn pause(&self, services: &[String]) -> Result<()> {
        let project = self.load_project()?;
        let selected = project.get_services(services)?;
        let reversed = reversed_by_dependencies(&project, &selected, false)?;

        let mut to_pause = Vec::new();
        for service in &reversed {
            if let Some(machine) = self.platforms.get(&service.container_name).await? {
                if machine.state == MachineState::Running {
                    to_pause.push(service.container_name.clone());
                }
            }
        }

        self.lifecycle_tree("pausing", to_pause, |platforms, name| async move {
            platforms.pause(&name).await
        })
        .await
    }

    /// Unpause paused machines in dependency order
    pub async fn unpause(&self, services: &[String]) -> Result<()> {
        let project = self.load_project()?;
        let selected = project.get_services(services)?;
        let ordered = ordered_by_dependencies(&project, &selected, true)?;

        let mut to_unpause = Vec::new();
        for service in &ordered {
            if let Some(machine) = self.platforms.get(&service.container_name).await? {
                if machine.state == MachineState::Paused {
                    to_unpause.push(service.container_name.clone());
                }
            }
        }

        self.lifecycle_tree("unpausing", to_unpause, |platforms, name| async move {
            platforms.unpause(&name).await
        })
        .await
    }

    /// Stop and remove the project's machines, then its networks and
    /// volumes.
    pub async fn down(&self, services: &[String], remove_volumes: bool) -> Result<()> {
        let project = self.load_project()?;
        let selected = project.get_services(services)?;
        let reversed = reversed_by_dependencies(&project, &selected, false)?;

        let mut embedded = self.embedded(&project).await?;

        for service in &reversed {
            if self.platforms.get(&service.container_name).await?.is_some() {
                tracing::info!(machine = %service.container_name, "removing");
                if let Err(e) = self.platforms.remove(&service.container_name).await {
                    tracing::error!(machine = %service.container_name, error = %e, "failed to remove");
                } else {
                    embedded.remove_machine(&service.container_name);
                }
            }
        }

        // Only whole-project downs tear down networks and volumes.
        if services.is_empty() {
            for network in project.networks.values() {
                if network.external {
                    continue;
                }
                if self.networks.get(&network.name)?.is_some() {
                    self.networks.remove(&network.name)?;
                }
                embedded.networks.retain(|n| n.name != network.name);
            }

            if remove_volumes {
                for volume in project.volumes.values() {
                    if volume.external {
                        continue;
                    }
                    if self.volumes.get(&volume.name)?.is_some() {
                        self.volumes.remove(&volume.name)?;
                    }
                    embedded.volumes.retain(|v| v.name != volume.name);
                }
            }
        }

        if embedded.machines.is_empty()
            && embedded.networks.is_empty()
            && embedded.volumes.is_empty()
        {
            self.store.remove(&project.name).await?;
        } else {
            self.store.update(embedded).await?;
        }

        Ok(())
    }

    async fn lifecycle_tree<F, Fut>(&self, verb: &str, names: Vec<String>, op: F) -> Result<()>
    where
        F: Fn(Arc<PlatformIterator>, String) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if names.is_empty() {
            return Ok(());
        }

        let mut items = Vec::new();
        for name in names {
            let platforms = Arc::clone(&self.platforms);
            let op = op.clone();
            let label = format!("{} {}", verb, name);
            items.push(ProcessTreeItem::new(&label, "", move |_ctx| {
                op(platforms, name)
            }));
        }

        // Serial so dependencies are fully handled before dependants.
        let tree = ProcessTree::new(
            ProcessTreeOptions {
                parallel: false,
                fail_fast: true,
                norender: self.opts.no_render,
                ..Default::default()
            },
            items,
        )?;
        tree.start().await
    }

    /// Shallow handle clone used to move the orchestrator's parts into
    /// progress-tree workers.
    fn clone_refs(&self) -> ComposeOrchestrator {
        ComposeOrchestrator {
            workdir: self.workdir.clone(),
            state_dir: self.state_dir.clone(),
            opts: self.opts.clone(),
            platforms: Arc::clone(&self.platforms),
            networks: Arc::clone(&self.networks),
            volumes: Arc::clone(&self.volumes),
            store: Arc::clone(&self.store),
            oci: Arc::clone(&self.oci),
            remote: self.remote.clone(),
        }
    }

    async fn embedded(&self, project: &Project) -> Result<EmbeddedProject> {
        let mut embedded = match self.store.get(&project.name).await? {
            Some(embedded) => embedded,
            None => EmbeddedProject {
                name: project.name.clone(),
                composefile: project.compose_files[0].clone(),
                workdir: project.workdir.clone(),
                machines: Vec::new(),
                networks: Vec::new(),
                volumes: Vec::new(),
                updated_at: chrono::Utc::now(),
            },
        };

        // Reconcile the record against what actually exists.
        let mut live_machines = Vec::new();
        for meta in &embedded.machines {
            if self.platforms.get(&meta.name).await?.is_some() {
                live_machines.push(meta.clone());
            }
        }
        embedded.machines = live_machines;
        embedded
            .networks
            .retain(|meta| matches!(self.networks.get(&meta.name), Ok(Some(_))));
        embedded
            .volumes
            .retain(|meta| matches!(self.volumes.get(&meta.name), Ok(Some(_))));

        Ok(embedded)
    }

    /// Delete machines, networks and volumes recorded for this project
    /// but no longer declared by it.
    async fn remove_orphans(&self, project: &Project) -> Result<()> {
        let Some(embedded) = self.store.get(&project.name).await? else {
            return Ok(());
        };

        let declared_machines: Vec<&str> = project
            .services
            .iter()
            .map(|s| s.container_name.as_str())
            .collect();
        for ObjectMeta { name } in &embedded.machines {
            if !declared_machines.contains(&name.as_str())
                && self.platforms.get(name).await?.is_some()
            {
                tracing::info!(machine = %name, "removing orphan machine");
                self.platforms.remove(name).await?;
            }
        }

        let declared_networks: Vec<&str> = project
            .networks
            .values()
            .map(|n| n.name.as_str())
            .collect();
        for ObjectMeta { name } in &embedded.networks {
            if !declared_networks.contains(&name.as_str()) && self.networks.get(name)?.is_some() {
                tracing::info!(network = %name, "removing orphan network");
                self.networks.remove(name)?;
            }
        }

        let declared_volumes: Vec<&str> =
            project.volumes.values().map(|v| v.name.as_str()).collect();
        for ObjectMeta { name } in &embedded.volumes {
            if !declared_volumes.contains(&name.as_str()) && self.volumes.get(name)?.is_some() {
                tracing::info!(volume = %name, "removing orphan volume");
                self.volumes.remove(name)?;
            }
        }

        Ok(())
    }

    /// Build a service's initrd from its Dockerfile context
    async fn build_artifact(
        &self,
        project: &Project,
        service: &Service,
    ) -> Result<RunnableArtifact> {
        let Some(build) = &service.build else {
            return Err(KilnError::Build(format!(
                "service {} has no build context",
                service.name
            )));
        };

        let (_, arch) = service.plat_arch()?;
        let context = project.workdir.join(&build.context);
        let dockerfile = context.join(build.dockerfile.as_deref().unwrap_or("Dockerfile"));

        tracing::info!(service = %service.name, "building service");

        let output = self
            .state_dir
            .join("initrd")
            .join(format!("{}.cpio", service.container_name));

        let opts = InitrdOptions::default()
            .workdir(context)
            .arch(arch)
            .output(output)
            .cache_dir(self.state_dir.join("buildkit-cache"));

        let mut driver = DockerfileInitrd::new(&dockerfile, opts)?;
        for arg in build
            .args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(self.opts.build_args.iter().cloned())
        {
            driver = driver.build_arg(&arg);
        }
        if let Some(target) = build.target.as_deref().or(self.opts.build_target.as_deref()) {
            driver = driver.build_target(target);
        }
        for secret in &self.opts.build_secrets {
            driver = driver.secret(crate::initrd::BuildSecret::parse(secret)?);
        }

        let initrd_path = driver.build().await?;

        let kernel = self.kernel_path()?;
        Ok(RunnableArtifact {
            kernel,
            initrd: Some(initrd_path),
            args: driver.args(),
            env: driver.env(),
        })
    }

    /// Package a built artifact as an OCI image in the local store
    async fn package_artifact(
        &self,
        project: &Project,
        service: &Service,
        artifact: &RunnableArtifact,
    ) -> Result<()> {
        let image = service
            .image
            .clone()
            .unwrap_or_else(|| format!("{}-{}:latest", project.name, service.name));
        let (_, arch) = service.plat_arch()?;

        tracing::info!(service = %service.name, image = %image, "packaging service");

        let handle: Arc<dyn StorageHandler> = self.oci.clone();
        let mut manifest = Manifest::new(handle);
        manifest.set_architecture(arch);
        manifest.set_os("linux");
        manifest.set_kernel(&artifact.kernel)?;
        if let Some(initrd) = &artifact.initrd {
            manifest.set_initrd(initrd)?;
        }
        manifest.set_cmd(artifact.args.clone());
        manifest.set_env(artifact.env.clone());

        manifest.save(&image, None).await?;
        Ok(())
    }

    /// Find a runnable artifact for an image-named service: local store
    /// first, then the remote catalog, otherwise build and package it.
    async fn ensure_packaged(
        &self,
        project: &Project,
        service: &Service,
    ) -> Result<RunnableArtifact> {
        let Some(image) = service.image.clone() else {
            return Err(KilnError::Internal(format!(
                "service {} has no image reference",
                service.name
            )));
        };
        let (plat, arch) = service.plat_arch()?;

        tracing::debug!(service = %service.name, image = %image, "searching locally");
        if let Some(descriptor) = self.oci.resolve_reference(&image).await? {
            return self.unpack_artifact(&descriptor.digest).await;
        }

        if let Some(remote) = &self.remote {
            tracing::debug!(service = %service.name, image = %image, "searching remotely");
            if let Some(digest) = remote.pull(&image, plat, arch).await? {
                tracing::info!(service = %service.name, image = %image, "pulled service");
                return self.unpack_artifact(&digest).await;
            }
        }

        if service.build.is_none() {
            return Err(KilnError::Packaging(format!(
                "image {} not found locally or remotely and service {} has no build context",
                image, service.name
            )));
        }

        let artifact = self.build_artifact(project, service).await?;
        self.package_artifact(project, service, &artifact).await?;
        Ok(artifact)
    }

    /// Unpack a packaged image's kernel and initrd layers next to the
    /// store and recover its boot args and environment.
    async fn unpack_artifact(&self, digest: &str) -> Result<RunnableArtifact> {
        let (spec, config) = self.oci.resolve_manifest(digest).await?;

        let dest = self
            .state_dir
            .join("oci")
            .join("unpacked")
            .join(digest.trim_start_matches("sha256:"));
        std::fs::create_dir_all(&dest)?;

        let mut kernel = None;
        let mut initrd = None;
        for layer in &spec.layers {
            let well_known = if layer.annotations.contains_key(ANNOTATION_KERNEL_PATH) {
                Some(("kernel", &mut kernel))
            } else if layer.annotations.contains_key(ANNOTATION_INITRD_PATH) {
                Some(("initrd", &mut initrd))
            } else {
                None
            };

            let Some((name, slot)) = well_known else {
                continue;
            };

            let target = dest.join(name);
            if !target.exists() {
                let raw = self.oci.read_blob(&layer.digest).await?;
                extract_single_file(&raw, &target)?;
            }
            *slot = Some(target);
        }

        let kernel = kernel.ok_or_else(|| {
            KilnError::Packaging(format!("image {} carries no kernel layer", digest))
        })?;

        Ok(RunnableArtifact {
            kernel,
            initrd,
            args: config.config.cmd.clone(),
            env: config.config.env.clone(),
        })
    }

    /// Create the machine for a service
    async fn create_machine(
        &self,
        project: &Project,
        service: &Service,
        artifact: RunnableArtifact,
    ) -> Result<()> {
        let (plat, arch) = service.plat_arch()?;

        tracing::info!(service = %service.name, "creating service");

        if service.dns.len() > 2 {
            tracing::warn!(
                service = %service.name,
                "service has more than 2 DNS servers, only the first 2 will be used"
            );
        }

        let spec = MachineSpec {
            name: service.container_name.clone(),
            platform: plat.to_string(),
            arch: arch.to_string(),
            kernel: artifact.kernel,
            initrd: artifact.initrd,
            args: artifact.args,
            env: service.environ(),
            memory_bytes: service.memory_bytes(),
            networks: render_networks(project, service),
            ports: render_ports(service),
            volumes: render_volumes(project, service),
        };

        self.platforms.create(spec).await?;
        Ok(())
    }

    fn kernel_path(&self) -> Result<PathBuf> {
        match &self.opts.kernel {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => Err(KilnError::Build(format!(
                "kernel {} does not exist",
                path.display()
            ))),
            None => Err(KilnError::Build(
                "no kernel configured, pass --kernel".to_string(),
            )),
        }
    }
}

/// Render network attachments as
/// `<net-name>:<cidr>,dns0=…,dns1=…,hostname=…,domain=…`, omitting empty
/// fields.
fn render_networks(project: &Project, service: &Service) -> Vec<String> {
    let dns0 = service.dns.first().map(String::as_str).unwrap_or("");
    let dns1 = service.dns.get(1).map(String::as_str).unwrap_or("");

    let mut rendered = Vec::new();
    for (name, attachment) in &service.networks {
        let network_name = project
            .networks
            .get(name)
            .map(|n| n.name.as_str())
            .unwrap_or(name.as_str());

        let mut arg = format!(
            "{}:{}",
            network_name,
            attachment.ipv4_address.as_deref().unwrap_or("")
        );
        for (key, value) in [
            ("dns0", dns0),
            ("dns1", dns1),
            ("hostname", service.hostname.as_deref().unwrap_or("")),
            ("domain", service.domainname.as_deref().unwrap_or("")),
        ] {
            if !value.is_empty() {
                arg.push_str(&format!(",{}={}", key, value));
            }
        }
        rendered.push(arg);
    }
    rendered
}

/// Render port mappings as `<host-ip>:<host-port>:<container-port>/<proto>`
fn render_ports(service: &Service) -> Vec<String> {
    service
        .ports
        .iter()
        .map(|p| {
            format!(
                "{}:{}:{}/{}",
                p.host_ip, p.host_port, p.container_port, p.protocol
            )
        })
        .collect()
}

/// Render volume mounts as `<src>:<dst>`, resolving named volumes
fn render_volumes(project: &Project, service: &Service) -> Vec<String> {
    service
        .volumes
        .iter()
        .map(|v| {
            let source = project
                .volumes
                .get(&v.source)
                .map(|vol| vol.name.clone())
                .unwrap_or_else(|| v.source.clone());
            format!("{}:{}", source, v.target)
        })
        .collect()
}

/// Extract the single regular file held by a layer tar
fn extract_single_file(raw: &[u8], target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(raw);
    for entry in archive
        .entries()
        .map_err(|e| KilnError::MalformedTar(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| KilnError::MalformedTar(e.to_string()))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| KilnError::MalformedTar(e.to_string()))?;
        std::fs::write(target, data)?;
        return Ok(());
    }

    Err(KilnError::Packaging(format!(
        "layer holds no regular file for {}",
        target.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// A project workdir named `demo` so container names are predictable
    fn write_compose(dir: &Path, yaml: &str) -> PathBuf {
        let workdir = dir.join("demo");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::write(workdir.join("compose.yaml"), yaml).unwrap();
        workdir
    }

    fn orchestrator(workdir: &Path, state: &Path) -> ComposeOrchestrator {
        ComposeOrchestrator::new(
            workdir,
            state,
            OrchestratorOptions {
                no_render: true,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_render_helpers() {
        let temp = tempdir().unwrap();
        let workdir = write_compose(
            temp.path(),
            r#"
services:
  web:
    image: nginx
    hostname: web
    dns: [1.1.1.1, 8.8.8.8, 9.9.9.9]
    ports:
      - "127.0.0.1:8080:80"
    volumes:
      - data:/var/lib/www
    networks:
      backend:
        ipv4_address: 10.1.0.4
networks:
  backend:
    ipam:
      config:
        - subnet: 10.1.0.0/24
volumes:
  data: {}
"#,
        );

        let state = tempdir().unwrap();
        let orch = orchestrator(&workdir, state.path());
        let project = orch.load_project().unwrap();
        let web = project.service("web").unwrap();

        assert_eq!(
            render_networks(&project, web),
            vec!["backend:10.1.0.4,dns0=1.1.1.1,dns1=8.8.8.8,hostname=web"]
        );
        assert_eq!(render_ports(web), vec!["127.0.0.1:8080:80/tcp"]);
        assert_eq!(render_volumes(&project, web), vec!["data:/var/lib/www"]);
    }

    #[tokio::test]
    async fn test_create_makes_networks_and_volumes() {
        let temp = tempdir().unwrap();
        let workdir = write_compose(
            temp.path(),
            r#"
services:
  web:
    image: nginx
    networks:
      - backend
networks:
  backend:
    ipam:
      config:
        - subnet: 10.1.0.0/24
  outside:
    external: true
volumes:
  data: {}
  theirs:
    external: true
"#,
        );

        let state = tempdir().unwrap();
        let orch = orchestrator(&workdir, state.path());

        // Service creation fails without a packaged image, but networks
        // and volumes still come up and the run itself succeeds.
        orch.create(&[]).await.unwrap();

        assert!(orch.networks.get("backend").unwrap().is_some());
        assert!(orch.networks.get("outside").unwrap().is_none());
        assert!(orch.volumes.get("data").unwrap().is_some());
        assert!(orch.volumes.get("theirs").unwrap().is_none());

        let embedded = orch.store.get(&orch.load_project().unwrap().name).await;
        let embedded = embedded.unwrap().unwrap();
        assert_eq!(embedded.networks, vec![ObjectMeta::named("backend")]);
        assert_eq!(embedded.volumes, vec![ObjectMeta::named("data")]);
        assert!(embedded.machines.is_empty());
    }

    #[tokio::test]
    async fn test_create_packages_and_creates_machine() {
        let temp = tempdir().unwrap();
        let workdir = write_compose(
            temp.path(),
            r#"
services:
  web:
    image: acme/web:1.0
    mem_limit: 64m
"#,
        );

        let state = tempdir().unwrap();
        let orch = orchestrator(&workdir, state.path());

        // Pre-package the image into the local store the way a build
        // would have.
        let kernel = state.path().join("kernel");
        let initrd = state.path().join("boot.cpio");
        std::fs::write(&kernel, b"ELF").unwrap();
        std::fs::write(&initrd, b"070701").unwrap();

        let handle: Arc<dyn StorageHandler> = orch.oci.clone();
        let mut manifest = Manifest::new(handle);
        manifest.set_architecture("x86_64");
        manifest.set_os("linux");
        manifest.set_kernel(&kernel).unwrap();
        manifest.set_initrd(&initrd).unwrap();
        manifest.set_cmd(vec!["/start".to_string()]);
        manifest.save("acme/web:1.0", None).await.unwrap();

        orch.create(&[]).await.unwrap();

        let machine = orch.platforms.get("demo-web").await;
        let machine = match machine {
            Ok(Some(machine)) => machine,
            other => panic!("expected created machine, got {:?}", other.map(|_| ())),
        };
        assert_eq!(machine.state, MachineState::Created);
        assert_eq!(machine.spec.args, vec!["/start"]);
        assert_eq!(machine.spec.memory_bytes, 64 * 1024 * 1024);
        assert!(machine.spec.kernel.exists());
        assert!(machine.spec.initrd.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_down_removes_project_resources() {
        let temp = tempdir().unwrap();
        let workdir = write_compose(
            temp.path(),
            r#"
services:
  web:
    image: nginx
networks:
  backend:
    ipam:
      config:
        - subnet: 10.1.0.0/24
volumes:
  data: {}
"#,
        );

        let state = tempdir().unwrap();
        let orch = orchestrator(&workdir, state.path());
        orch.create(&[]).await.unwrap();
        assert!(orch.networks.get("backend").unwrap().is_some());

        orch.down(&[], true).await.unwrap();
        assert!(orch.networks.get("backend").unwrap().is_none());
        assert!(orch.volumes.get("data").unwrap().is_none());
        assert!(orch.store.get("demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_compose_file() {
        let temp = tempdir().unwrap();
        let state = tempdir().unwrap();
        let orch = orchestrator(temp.path(), state.path());

        let result = orch.create(&[]).await;
        assert!(matches!(result, Err(KilnError::NoComposeFile(_))));
    }
}
