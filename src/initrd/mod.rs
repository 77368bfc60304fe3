//! Initial root filesystem construction
//!
//! An initrd is a newc CPIO archive handed to the kernel at boot. It can be
//! supplied directly as a file or produced from a Dockerfile build.

pub mod cpio;
pub mod dockerfile;

pub use cpio::{pack_tar, CpioHeader, CpioWriter};
pub use dockerfile::{BuildSecret, DockerfileInitrd, SecretKind};

use crate::error::{KilnError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Options common to all initrd sources
#[derive(Debug, Clone, Default)]
pub struct InitrdOptions {
    /// Where the finished archive is written; a temp file when empty
    pub output: Option<PathBuf>,
    /// Working directory for relative paths and build contexts
    pub workdir: Option<PathBuf>,
    /// Target architecture for builds
    pub arch: Option<String>,
    /// Gzip the finished archive in place
    pub compress: bool,
    /// Build cache directory
    pub cache_dir: Option<PathBuf>,
}

impl InitrdOptions {
    /// Set the output path
    pub fn output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    /// Set the working directory
    pub fn workdir(mut self, path: PathBuf) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Set the target architecture
    pub fn arch(mut self, arch: &str) -> Self {
        self.arch = Some(arch.to_string());
        self
    }

    /// Enable gzip compression of the finished archive
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the build cache directory
    pub fn cache_dir(mut self, path: PathBuf) -> Self {
        self.cache_dir = Some(path);
        self
    }
}

/// A source of an initial root filesystem archive
#[async_trait]
pub trait Initrd: Send {
    /// Short name of the source kind
    fn name(&self) -> &'static str;

    /// Produce the archive and return its path
    async fn build(&mut self) -> Result<PathBuf>;

    /// Environment list captured from the source, if any
    fn env(&self) -> Vec<String>;

    /// Boot arguments captured from the source, if any
    fn args(&self) -> Vec<String>;
}

/// An initrd backed by an existing CPIO archive on disk
pub struct FileInitrd {
    path: PathBuf,
}

impl FileInitrd {
    /// Wrap an existing archive. The path must be a file and must differ
    /// from the configured output path, which would corrupt the archive.
    pub fn new(path: &Path, opts: &InitrdOptions) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            return Err(KilnError::Packaging(format!(
                "path {} is a directory, not a file",
                path.display()
            )));
        }

        if let Some(output) = &opts.output {
            let same = output
                .canonicalize()
                .ok()
                .zip(path.canonicalize().ok())
                .map(|(a, b)| a == b)
                .unwrap_or(false);
            if same {
                return Err(KilnError::Packaging(
                    "archive path is the same as the source path".to_string(),
                ));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

#[async_trait]
impl Initrd for FileInitrd {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn build(&mut self) -> Result<PathBuf> {
        Ok(self.path.clone())
    }

    fn env(&self) -> Vec<String> {
        Vec::new()
    }

    fn args(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_initrd() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("boot.cpio");
        std::fs::write(&path, b"070701").unwrap();

        let mut initrd = FileInitrd::new(&path, &InitrdOptions::default()).unwrap();
        assert_eq!(initrd.name(), "file");
        assert_eq!(initrd.build().await.unwrap(), path);
        assert!(initrd.env().is_empty());
        assert!(initrd.args().is_empty());
    }

    #[test]
    fn test_file_initrd_rejects_directory() {
        let temp = tempdir().unwrap();
        let result = FileInitrd::new(temp.path(), &InitrdOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_file_initrd_rejects_output_equal_to_source() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("boot.cpio");
        std::fs::write(&path, b"070701").unwrap();

        let opts = InitrdOptions::default().output(path.clone());
        let result = FileInitrd::new(&path, &opts);
        assert!(result.is_err());
    }
}
