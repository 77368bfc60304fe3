//! Image reference parsing

use super::DEFAULT_TAG;
use crate::error::{KilnError, Result};

/// A parsed image reference: `[registry/]repository[:tag]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: String,
}

impl Reference {
    /// Parse a full reference. The registry defaults to empty and the tag
    /// to `latest`. Digest references are not accepted.
    pub fn parse(fullref: &str) -> Result<Self> {
        if fullref.is_empty() {
            return Err(KilnError::InvalidReference {
                reference: fullref.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        if fullref.contains('@') {
            return Err(KilnError::InvalidReference {
                reference: fullref.to_string(),
                reason: "digest references are not supported".to_string(),
            });
        }

        // A first component containing a dot or port, or "localhost",
        // names a registry.
        let (registry, remainder) = match fullref.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest)
            }
            _ => (String::new(), fullref),
        };

        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (remainder.to_string(), DEFAULT_TAG.to_string()),
        };

        if repository.is_empty() {
            return Err(KilnError::InvalidReference {
                reference: fullref.to_string(),
                reason: "empty repository".to_string(),
            });
        }

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// The registry host, possibly empty
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The reference without its tag: `[registry/]repository`
    pub fn context(&self) -> String {
        if self.registry.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }

    /// The full reference: `[registry/]repository:tag`
    pub fn name(&self) -> String {
        format!("{}:{}", self.context(), self.tag)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
