//! Compose file discovery and parsing

use super::config::ComposeConfig;
use crate::error::{KilnError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default compose file names, tried in order
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
    "Composefile",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find a compose file in the directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Locate the compose file: an explicit path if given, otherwise the
    /// first default name present in the working directory.
    pub fn resolve_compose_file(workdir: &Path, explicit: Option<&str>) -> Result<PathBuf> {
        if let Some(file) = explicit {
            let path = workdir.join(file);
            if !path.exists() {
                return Err(KilnError::NoComposeFile(path.display().to_string()));
            }
            return Ok(path);
        }

        Self::find_compose_file(workdir)
            .ok_or_else(|| KilnError::NoComposeFile(workdir.display().to_string()))
    }

    /// Parse a compose file from a path
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KilnError::ComposeParse(format!("failed to read file: {}", e)))?;

        Self::parse_str(&content)
    }

    /// Parse a compose file from a string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| KilnError::ComposeParse(format!("failed to parse YAML: {}", e)))
    }

    /// Interpolate environment variables in string fields of the config
    pub fn interpolate(config: &mut ComposeConfig, env: &HashMap<String, String>) {
        for service in config.services.values_mut() {
            if let Some(ref mut image) = service.image {
                *image = interpolate_string(image, env);
            }

            if let Some(ref mut environment) = service.environment {
                match environment {
                    super::config::EnvironmentConfig::Map(map) => {
                        for value in map.values_mut() {
                            if let Some(v) = value {
                                *v = interpolate_string(v, env);
                            }
                        }
                    }
                    super::config::EnvironmentConfig::Array(arr) => {
                        for item in arr.iter_mut() {
                            *item = interpolate_string(item, env);
                        }
                    }
                }
            }
        }
    }
}

/// Interpolate environment variables in a string
fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    let mut result = s.to_string();

    // ${VAR:-default} syntax first, so plain substitution doesn't eat it
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*):-([^}]*)\}").unwrap();
    result = re
        .replace_all(&result, |caps: &regex::Captures| {
            let var = &caps[1];
            let default = &caps[2];
            env.get(var).cloned().unwrap_or_else(|| default.to_string())
        })
        .to_string();

    // ${VAR} and $VAR syntax
    for (key, value) in env {
        result = result.replace(&format!("${{{}}}", key), value);
        result = result.replace(&format!("${}", key), value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("web"));
        assert!(config.services.contains_key("db"));
    }

    #[test]
    fn test_parse_networks_and_deps() {
        let yaml = r#"
services:
  web:
    image: nginx
    depends_on:
      db:
        condition: service_started
    networks:
      backend:
        ipv4_address: 10.1.0.4
  db:
    image: postgres
    networks:
      - backend
networks:
  backend:
    ipam:
      config:
        - subnet: 10.1.0.0/24
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        assert!(config.networks.contains_key("backend"));

        let web = &config.services["web"];
        match web.networks.as_ref().unwrap() {
            super::super::config::NetworksConfig::Map(map) => {
                let attach = map["backend"].as_ref().unwrap();
                assert_eq!(attach.ipv4_address.as_deref(), Some("10.1.0.4"));
            }
            _ => panic!("expected map form"),
        }
    }

    #[test]
    fn test_resolve_compose_file() {
        let temp = tempdir().unwrap();
        assert!(ComposeParser::resolve_compose_file(temp.path(), None).is_err());

        std::fs::write(temp.path().join("compose.yaml"), "services: {}").unwrap();
        std::fs::write(temp.path().join("docker-compose.yml"), "services: {}").unwrap();

        // docker-compose.yml wins over compose.yaml
        let found = ComposeParser::resolve_compose_file(temp.path(), None).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }

    #[test]
    fn test_interpolate() {
        let mut env = HashMap::new();
        env.insert("TAG".to_string(), "1.0.0".to_string());

        assert_eq!(interpolate_string("nginx:${TAG}", &env), "nginx:1.0.0");
        assert_eq!(
            interpolate_string("nginx:${VERSION:-latest}", &env),
            "nginx:latest"
        );
    }
}
