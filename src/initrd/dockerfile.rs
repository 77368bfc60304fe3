//! Dockerfile-backed initrd construction
//!
//! Builds the service's root filesystem by solving a Dockerfile through a
//! BuildKit daemon. The solve exports both a filesystem tar and an OCI
//! archive; the tar becomes the CPIO initrd and the OCI image config
//! supplies the boot arguments and environment. When no daemon is
//! reachable an ephemeral `moby/buildkit` container is started on a free
//! port for the duration of the build.

use super::cpio::{compress_in_place, pack_tar, CpioWriter};
use super::{Initrd, InitrdOptions};
use crate::error::{KilnError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Environment variable naming the BuildKit daemon address
pub const BUILDKIT_HOST_ENV: &str = "KILN_BUILDKIT_HOST";

/// Default BuildKit daemon address
pub const DEFAULT_BUILDKIT_ADDR: &str = "tcp://127.0.0.1:1234";

/// Image used for the ephemeral BuildKit container
pub const BUILDKIT_IMAGE: &str = "moby/buildkit:v0.18.1";

/// Named volume mounted at /var/lib/buildkit for build caching
pub const BUILDKIT_CACHE_VOLUME: &str = "kiln-buildkit-cache";

/// Kind of a build secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    /// Secret read from a file
    File,
    /// Secret read from an environment variable
    Env,
}

/// A parsed `--build-secret` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSecret {
    /// Identifier the Dockerfile refers to
    pub id: String,
    /// Secret kind
    pub kind: SecretKind,
    /// Absolute source path for file secrets
    pub source: Option<PathBuf>,
    /// Environment variable name for env secrets
    pub env: Option<String>,
}

impl BuildSecret {
    /// Parse comma-separated `key=value` fields:
    /// `type=file|env`, `id=…`, `source|src=…`, `env=…`.
    pub fn parse(val: &str) -> Result<Self> {
        let mut kind = None;
        let mut id = String::new();
        let mut source = None;
        let mut env = None;

        for field in val.split(',') {
            let (key, value) = field.split_once('=').ok_or_else(|| {
                KilnError::SecretSyntax(format!("field '{}' must be a key=value pair", field))
            })?;

            match key.to_lowercase().as_str() {
                "type" => match value {
                    "file" => kind = Some(SecretKind::File),
                    "env" => kind = Some(SecretKind::Env),
                    other => {
                        return Err(KilnError::SecretSyntax(format!(
                            "unsupported secret type '{}'",
                            other
                        )))
                    }
                },
                "id" => id = value.to_string(),
                "source" | "src" => {
                    let path = PathBuf::from(value);
                    let abs = if path.is_absolute() {
                        path
                    } else {
                        std::env::current_dir()?.join(path)
                    };
                    source = Some(abs);
                }
                "env" => env = Some(value.to_string()),
                other => {
                    return Err(KilnError::SecretSyntax(format!(
                        "unexpected key '{}' in '{}'",
                        other, field
                    )))
                }
            }
        }

        let kind = kind.ok_or_else(|| {
            KilnError::SecretSyntax("secret requires a type=file|env field".to_string())
        })?;

        let mut secret = Self {
            id,
            kind,
            source,
            env,
        };

        // An env secret given only a source names the variable there.
        if secret.kind == SecretKind::Env && secret.env.is_none() {
            secret.env = secret
                .source
                .take()
                .map(|p| p.to_string_lossy().to_string());
        }

        Ok(secret)
    }

    fn as_flag(&self) -> String {
        match self.kind {
            SecretKind::File => format!(
                "id={},src={}",
                self.id,
                self.source
                    .as_deref()
                    .unwrap_or(Path::new(""))
                    .display()
            ),
            SecretKind::Env => {
                format!("id={},env={}", self.id, self.env.as_deref().unwrap_or(""))
            }
        }
    }
}

/// In-memory registry credentials, looked up by host.
///
/// Token-based endpoints are not supported; only basic credentials are
/// handed to the build session.
#[derive(Debug, Clone, Default)]
pub struct AuthProvider {
    auths: HashMap<String, (String, String)>,
}

impl AuthProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register credentials for a registry host
    pub fn add(&mut self, host: &str, user: &str, token: &str) {
        self.auths
            .insert(host.to_string(), (user.to_string(), token.to_string()));
    }

    /// Look up credentials for a host
    pub fn credentials(&self, host: &str) -> Option<(&str, &str)> {
        self.auths
            .get(host)
            .map(|(user, token)| (user.as_str(), token.as_str()))
    }

    /// Token fetching is always unavailable
    pub fn fetch_token(&self, _host: &str) -> Result<String> {
        Err(KilnError::Build("client side tokens disabled".to_string()))
    }

    /// Whether any credentials are registered
    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    /// Materialize a docker config directory the build client can read
    /// through `DOCKER_CONFIG`.
    pub fn write_docker_config(&self, dir: &Path) -> Result<PathBuf> {
        let mut auths = serde_json::Map::new();
        for (host, (user, token)) in &self.auths {
            let encoded = BASE64.encode(format!("{}:{}", user, token));
            auths.insert(
                host.clone(),
                serde_json::json!({ "auth": encoded }),
            );
        }

        let config = serde_json::json!({ "auths": auths });
        std::fs::create_dir_all(dir)?;
        let path = dir.join("config.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&config)?)?;
        Ok(path)
    }
}

/// An initrd built from a Dockerfile through BuildKit
pub struct DockerfileInitrd {
    opts: InitrdOptions,
    dockerfile: PathBuf,
    workdir: PathBuf,
    build_args: Vec<String>,
    build_target: Option<String>,
    secrets: Vec<BuildSecret>,
    auths: AuthProvider,
    args: Vec<String>,
    env: Vec<String>,
}

impl DockerfileInitrd {
    /// Create a driver for the given Dockerfile path. The file name,
    /// case-folded, must contain `dockerfile`.
    pub fn new(path: &Path, opts: InitrdOptions) -> Result<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !file_name.contains("dockerfile") {
            return Err(KilnError::NotADockerfile(path.display().to_string()));
        }

        let (dockerfile, workdir) = if path.is_absolute() {
            let workdir = opts
                .workdir
                .clone()
                .unwrap_or_else(|| path.parent().unwrap_or(Path::new("/")).to_path_buf());
            (path.to_path_buf(), workdir)
        } else {
            let workdir = opts
                .workdir
                .clone()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
            (workdir.join(path), workdir)
        };

        let meta = std::fs::metadata(&dockerfile)
            .map_err(|e| KilnError::Build(format!("could not check Dockerfile: {}", e)))?;
        if meta.is_dir() {
            return Err(KilnError::NotADockerfile(dockerfile.display().to_string()));
        }

        Ok(Self {
            opts,
            dockerfile,
            workdir,
            build_args: Vec::new(),
            build_target: None,
            secrets: Vec::new(),
            auths: AuthProvider::new(),
            args: Vec::new(),
            env: Vec::new(),
        })
    }

    /// Add a `key=value` build argument; a bare key falls back to the
    /// process environment at solve time.
    pub fn build_arg(mut self, arg: &str) -> Self {
        self.build_args.push(arg.to_string());
        self
    }

    /// Set the multi-stage build target
    pub fn build_target(mut self, target: &str) -> Self {
        self.build_target = Some(target.to_string());
        self
    }

    /// Add a build secret
    pub fn secret(mut self, secret: BuildSecret) -> Self {
        self.secrets.push(secret);
        self
    }

    /// Set registry credentials for the build session
    pub fn auths(mut self, auths: AuthProvider) -> Self {
        self.auths = auths;
        self
    }

    fn frontend_attrs(&self) -> Vec<(String, String)> {
        let mut attrs = vec![(
            "filename".to_string(),
            self.dockerfile
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        )];

        if let Some(target) = &self.build_target {
            attrs.push(("target".to_string(), target.clone()));
        }

        if let Some(arch) = &self.opts.arch {
            attrs.push(("platform".to_string(), format!("linux/{}", arch)));
        }

        for arg in &self.build_args {
            match arg.split_once('=') {
                Some((k, v)) => attrs.push((format!("build-arg:{}", k), v.to_string())),
                None => match std::env::var(arg) {
                    Ok(v) => attrs.push((format!("build-arg:{}", arg), v)),
                    Err(_) => {
                        tracing::warn!(arg = %arg, "could not find build-arg in environment");
                    }
                },
            }
        }

        attrs
    }

    fn solve_args(&self, addr: &str, tar_out: &Path, oci_out: &Path) -> Vec<String> {
        let mut args = vec![
            "--addr".to_string(),
            addr.to_string(),
            "build".to_string(),
            "--frontend".to_string(),
            "dockerfile.v0".to_string(),
            "--local".to_string(),
            format!("context={}", self.workdir.display()),
            "--local".to_string(),
            format!("dockerfile={}", self.workdir.display()),
        ];

        for (key, value) in self.frontend_attrs() {
            args.push("--opt".to_string());
            args.push(format!("{}={}", key, value));
        }

        for secret in &self.secrets {
            args.push("--secret".to_string());
            args.push(secret.as_flag());
        }

        if let Some(agent) = ssh_agent_path() {
            args.push("--ssh".to_string());
            args.push(format!("default={}", agent.display()));
        }

        args.push("--output".to_string());
        args.push(format!("type=tar,dest={}", tar_out.display()));
        args.push("--output".to_string());
        args.push(format!("type=oci,dest={}", oci_out.display()));

        if let Some(cache) = &self.opts.cache_dir {
            args.push("--export-cache".to_string());
            args.push(format!(
                "type=local,dest={},ignore-error=true",
                cache.display()
            ));
        }

        args
    }

    async fn solve(&self, addr: &str, tar_out: &Path, oci_out: &Path) -> Result<()> {
        let mut cmd = Command::new("buildctl");
        cmd.args(self.solve_args(addr, tar_out, oci_out))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !self.auths.is_empty() {
            let config_dir = temp_path("docker-config");
            self.auths.write_docker_config(&config_dir)?;
            cmd.env("DOCKER_CONFIG", &config_dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| KilnError::Build(format!("could not run buildctl: {}", e)))?;

        // Progress messages from the solve feed the log writer line by line.
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!("{}", line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| KilnError::Build(format!("could not wait for buildctl: {}", e)))?;

        if !status.success() {
            return Err(KilnError::Build(format!(
                "solve failed with status {}",
                status
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Initrd for DockerfileInitrd {
    fn name(&self) -> &'static str {
        "dockerfile"
    }

    async fn build(&mut self) -> Result<PathBuf> {
        let output = match &self.opts.output {
            Some(path) => path.clone(),
            None => {
                let path = temp_path("initrd");
                self.opts.output = Some(path.clone());
                path
            }
        };

        let tar_out = temp_path("rootfs-tar");
        let oci_out = temp_path("rootfs-oci");

        let (addr, ephemeral) = connect_buildkit().await?;

        let solved = self.solve(&addr, &tar_out, &oci_out).await;

        if let Some(container) = ephemeral {
            container.terminate().await;
        }
        solved?;

        let config = extract_image_config(&oci_out)?;
        let mut args = config.entrypoint;
        args.extend(config.cmd);
        self.args = strip_shell_prefix(args);
        self.env = config.env;

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tar_file = std::fs::File::open(&tar_out)?;
        let out_file = std::fs::File::create(&output)?;
        let mut writer = CpioWriter::new(std::io::BufWriter::new(out_file));
        pack_tar(tar_file, &mut writer)?;
        drop(writer);

        if self.opts.compress {
            compress_in_place(&output)?;
        }

        let _ = std::fs::remove_file(&tar_out);
        let _ = std::fs::remove_file(&oci_out);

        Ok(output)
    }

    fn env(&self) -> Vec<String> {
        self.env.clone()
    }

    fn args(&self) -> Vec<String> {
        self.args.clone()
    }
}

/// Drop a leading `/bin/sh -c` pair from the boot arguments
pub(crate) fn strip_shell_prefix(args: Vec<String>) -> Vec<String> {
    if args.len() >= 2 && args[0] == "/bin/sh" && args[1] == "-c" {
        args[2..].to_vec()
    } else {
        args
    }
}

/// SSH agent socket to forward into the build, if any
fn ssh_agent_path() -> Option<PathBuf> {
    // A kiln-specific agent wins over the ambient one.
    for var in ["KILN_BUILDKIT_SSH_AGENT", "SSH_AUTH_SOCK"] {
        if let Ok(path) = std::env::var(var) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
    }
    None
}

fn temp_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("kiln-{}-{}", prefix, uuid::Uuid::new_v4()))
}

/// A BuildKit daemon started for the duration of one build
struct EphemeralBuildkit {
    name: String,
}

impl EphemeralBuildkit {
    async fn terminate(&self) {
        let result = Command::new("docker")
            .args(["rm", "-f", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::debug!(container = %self.name, error = %e, "terminating buildkit container");
        }
    }
}

/// Connect to the configured BuildKit daemon, starting an ephemeral
/// container when nothing answers.
async fn connect_buildkit() -> Result<(String, Option<EphemeralBuildkit>)> {
    let addr =
        std::env::var(BUILDKIT_HOST_ENV).unwrap_or_else(|_| DEFAULT_BUILDKIT_ADDR.to_string());

    if probe(&addr).await {
        tracing::debug!(addr = %addr, "using buildkit");
        return Ok((addr, None));
    }

    tracing::info!("creating ephemeral buildkit container");

    // Port 0 means "give me any free port".
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };

    let name = format!("kiln-buildkit-{}", uuid::Uuid::new_v4());
    let status = Command::new("docker")
        .args([
            "run",
            "-d",
            "--rm",
            "--privileged",
            "--name",
            &name,
            "-v",
            &format!("{}:/var/lib/buildkit", BUILDKIT_CACHE_VOLUME),
            "-p",
            &format!("{}:{}", port, port),
            BUILDKIT_IMAGE,
            "--addr",
            &format!("tcp://0.0.0.0:{}", port),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| KilnError::Build(format!("creating buildkit container: {}", e)))?;

    if !status.success() {
        warn_buildkit_unreachable(&addr);
        return Err(KilnError::Build(
            "could not start ephemeral buildkit container".to_string(),
        ));
    }

    let container_addr = format!("tcp://127.0.0.1:{}", port);
    for _ in 0..60 {
        if probe(&container_addr).await {
            return Ok((container_addr, Some(EphemeralBuildkit { name })));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    EphemeralBuildkit { name }.terminate().await;
    warn_buildkit_unreachable(&addr);
    Err(KilnError::Build("buildkit container never became ready".to_string()))
}

fn warn_buildkit_unreachable(addr: &str) {
    tracing::warn!("could not connect to BuildKit client '{}', is BuildKit running?", addr);
    tracing::warn!("run BuildKit in a container with:");
    tracing::warn!("  docker run --rm -d --name buildkit --privileged {}", BUILDKIT_IMAGE);
    tracing::warn!("  export {}=tcp://127.0.0.1:1234", BUILDKIT_HOST_ENV);
}

/// TCP probe of a `tcp://host:port` address
async fn probe(addr: &str) -> bool {
    let Some(hostport) = addr.strip_prefix("tcp://") else {
        return false;
    };

    matches!(
        tokio::time::timeout(
            Duration::from_secs(2),
            tokio::net::TcpStream::connect(hostport),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Runtime configuration recovered from the built image
#[derive(Debug, Default)]
pub struct ExtractedConfig {
    /// Image entrypoint
    pub entrypoint: Vec<String>,
    /// Image command
    pub cmd: Vec<String>,
    /// Image environment
    pub env: Vec<String>,
}

#[derive(Deserialize)]
struct OciIndex {
    manifests: Vec<OciIndexEntry>,
}

#[derive(Deserialize)]
struct OciIndexEntry {
    digest: String,
}

#[derive(Deserialize)]
struct OciManifestDoc {
    config: OciManifestConfig,
}

#[derive(Deserialize)]
struct OciManifestConfig {
    digest: String,
}

#[derive(Deserialize)]
struct ImageConfigDoc {
    #[serde(default)]
    config: ImageRuntimeConfig,
}

#[derive(Deserialize, Default)]
struct ImageRuntimeConfig {
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default)]
    cmd: Vec<String>,
    #[serde(rename = "Env", default)]
    env: Vec<String>,
}

/// Pull `Entrypoint`, `Cmd` and `Env` out of an OCI archive produced by
/// the solve's OCI export.
pub fn extract_image_config(oci_archive: &Path) -> Result<ExtractedConfig> {
    let index_bytes = read_archive_entry(oci_archive, "index.json")?.ok_or_else(|| {
        KilnError::Build("OCI archive is missing index.json".to_string())
    })?;
    let index: OciIndex = serde_json::from_slice(&index_bytes)?;
    let manifest_digest = index
        .manifests
        .first()
        .map(|m| m.digest.clone())
        .ok_or_else(|| KilnError::Build("OCI archive has no manifests".to_string()))?;

    let manifest_bytes = read_archive_entry(oci_archive, &blob_path(&manifest_digest)?)?
        .ok_or_else(|| KilnError::Build("OCI archive is missing its manifest".to_string()))?;
    let manifest: OciManifestDoc = serde_json::from_slice(&manifest_bytes)?;

    let config_bytes = read_archive_entry(oci_archive, &blob_path(&manifest.config.digest)?)?
        .ok_or_else(|| KilnError::Build("OCI archive is missing its image config".to_string()))?;
    let config: ImageConfigDoc = serde_json::from_slice(&config_bytes)?;

    Ok(ExtractedConfig {
        entrypoint: config.config.entrypoint,
        cmd: config.config.cmd,
        env: config.config.env,
    })
}

fn blob_path(digest: &str) -> Result<String> {
    let hex = digest.strip_prefix("sha256:").ok_or_else(|| {
        KilnError::Build(format!("unsupported digest algorithm in {}", digest))
    })?;
    Ok(format!("blobs/sha256/{}", hex))
}

fn read_archive_entry(archive: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(file);

    for entry in tar
        .entries()
        .map_err(|e| KilnError::MalformedTar(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| KilnError::MalformedTar(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| KilnError::MalformedTar(e.to_string()))?;

        if path.to_string_lossy() == name {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| KilnError::MalformedTar(e.to_string()))?;
            return Ok(Some(data));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    #[test]
    fn test_parse_file_secret() {
        let secret = BuildSecret::parse("type=file,id=npmrc,src=/home/me/.npmrc").unwrap();
        assert_eq!(secret.kind, SecretKind::File);
        assert_eq!(secret.id, "npmrc");
        assert_eq!(secret.source.as_deref(), Some(Path::new("/home/me/.npmrc")));
    }

    #[test]
    fn test_parse_env_secret() {
        let secret = BuildSecret::parse("type=env,id=token,env=GITHUB_TOKEN").unwrap();
        assert_eq!(secret.kind, SecretKind::Env);
        assert_eq!(secret.env.as_deref(), Some("GITHUB_TOKEN"));
    }

    #[test]
    fn test_parse_env_secret_via_source() {
        let secret = BuildSecret::parse("type=env,id=token,src=/GITHUB_TOKEN").unwrap();
        assert_eq!(secret.env.as_deref(), Some("/GITHUB_TOKEN"));
        assert!(secret.source.is_none());
    }

    #[test]
    fn test_parse_secret_rejects_bad_input() {
        assert!(BuildSecret::parse("type=vault,id=x").is_err());
        assert!(BuildSecret::parse("id").is_err());
        assert!(BuildSecret::parse("type=file,unknown=1").is_err());
        assert!(BuildSecret::parse("id=x,src=/tmp/x").is_err());
    }

    #[test]
    fn test_strip_shell_prefix() {
        let args = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "exec myapp".to_string(),
        ];
        assert_eq!(strip_shell_prefix(args), vec!["exec myapp".to_string()]);

        let plain = vec!["/usr/bin/myapp".to_string()];
        assert_eq!(strip_shell_prefix(plain.clone()), plain);
    }

    #[test]
    fn test_not_a_dockerfile() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("Makefile");
        std::fs::write(&path, "all:").unwrap();

        let result = DockerfileInitrd::new(&path, InitrdOptions::default());
        assert!(matches!(result, Err(KilnError::NotADockerfile(_))));
    }

    #[test]
    fn test_dockerfile_name_case_folded() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("app.DOCKERFILE");
        std::fs::write(&path, "FROM scratch").unwrap();

        assert!(DockerfileInitrd::new(&path, InitrdOptions::default()).is_ok());
    }

    #[test]
    fn test_solve_args_assembly() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("Dockerfile");
        std::fs::write(&path, "FROM scratch").unwrap();

        let opts = InitrdOptions::default()
            .workdir(temp.path().to_path_buf())
            .arch("x86_64");
        let driver = DockerfileInitrd::new(&path, opts)
            .unwrap()
            .build_arg("VERSION=1.0")
            .build_target("release");

        let args = driver.solve_args(
            "tcp://127.0.0.1:1234",
            Path::new("/tmp/out.tar"),
            Path::new("/tmp/out.oci"),
        );
        let joined = args.join(" ");

        assert!(joined.contains("--frontend dockerfile.v0"));
        assert!(joined.contains(&format!("context={}", temp.path().display())));
        assert!(joined.contains("--opt filename=Dockerfile"));
        assert!(joined.contains("--opt target=release"));
        assert!(joined.contains("--opt platform=linux/x86_64"));
        assert!(joined.contains("--opt build-arg:VERSION=1.0"));
        assert!(joined.contains("type=tar,dest=/tmp/out.tar"));
        assert!(joined.contains("type=oci,dest=/tmp/out.oci"));
    }

    #[test]
    fn test_auth_provider() {
        let mut auths = AuthProvider::new();
        auths.add("ghcr.io", "me", "s3cret");

        assert_eq!(auths.credentials("ghcr.io"), Some(("me", "s3cret")));
        assert_eq!(auths.credentials("docker.io"), None);
        assert!(auths.fetch_token("ghcr.io").is_err());

        let temp = tempdir().unwrap();
        let config = auths.write_docker_config(temp.path()).unwrap();
        let raw = std::fs::read_to_string(config).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed["auths"]["ghcr.io"]["auth"].is_string());
    }

    fn synthetic_oci_archive(config_json: &[u8]) -> Vec<u8> {
        let config_digest = format!("{:x}", Sha256::digest(config_json));
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": format!("sha256:{}", config_digest),
                "size": config_json.len(),
            },
            "layers": [],
        });
        let manifest_json = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = format!("{:x}", Sha256::digest(&manifest_json));

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": format!("sha256:{}", manifest_digest),
                "size": manifest_json.len(),
            }],
        });
        let index_json = serde_json::to_vec(&index).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in [
            ("index.json".to_string(), index_json),
            (format!("blobs/sha256/{}", manifest_digest), manifest_json),
            (
                format!("blobs/sha256/{}", config_digest),
                config_json.to_vec(),
            ),
        ] {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_path(&name).unwrap();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append(&header, data.as_slice()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_image_config() {
        let config_json = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Entrypoint": ["/bin/sh", "-c"],
                "Cmd": ["exec myapp"],
                "Env": ["PATH=/usr/bin"],
            },
        }))
        .unwrap();

        let temp = tempdir().unwrap();
        let archive = temp.path().join("image.oci");
        std::fs::write(&archive, synthetic_oci_archive(&config_json)).unwrap();

        let config = extract_image_config(&archive).unwrap();
        assert_eq!(config.entrypoint, vec!["/bin/sh", "-c"]);
        assert_eq!(config.cmd, vec!["exec myapp"]);
        assert_eq!(config.env, vec!["PATH=/usr/bin"]);

        let mut args = config.entrypoint;
        args.extend(config.cmd);
        assert_eq!(strip_shell_prefix(args), vec!["exec myapp".to_string()]);
    }
}
