//! testbed.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable naming a testbed.toml to load.
pub const CONFIG_ENV_VAR: &str = "TESTBED_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestbedConfig {
    /// Prefix for generated namespace names (`<prefix>-<suffix>`).
    pub namespace_prefix: String,
    /// Where the environment document is saved for later reattach.
    pub persisted_path: Option<PathBuf>,
    /// Keep the environment alive when a deferred teardown fires.
    pub persistent: bool,
    pub connection: ConnectionConfig,
    pub kube: KubeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Host used when composing local tunnel URLs.
    pub local_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KubeConfig {
    pub helm_bin: String,
    pub kubectl_bin: String,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Passed to `helm --timeout` (e.g. "5m").
    pub install_timeout: String,
    /// Wait for resources to become ready before install returns.
    pub wait: bool,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "testbed".to_string(),
            persisted_path: None,
            persistent: false,
            connection: ConnectionConfig::default(),
            kube: KubeConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            helm_bin: "helm".to_string(),
            kubectl_bin: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
            install_timeout: "5m".to_string(),
            wait: true,
        }
    }
}

impl TestbedConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load from the file named by `TESTBED_CONFIG`, or fall back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                let path = PathBuf::from(path);
                tracing::debug!(path = %path.display(), "loading testbed config");
                Self::from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let config = TestbedConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("namespace_prefix = \"testbed\""));
        let back = TestbedConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
namespace_prefix = "ccip"
persistent = true

[kube]
context = "kind-local"
"#;
        let config = TestbedConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.namespace_prefix, "ccip");
        assert!(config.persistent);
        assert_eq!(config.kube.context.as_deref(), Some("kind-local"));
        assert_eq!(config.kube.helm_bin, "helm");
        assert_eq!(config.connection.local_host, "127.0.0.1");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbed.toml");
        std::fs::write(&path, "persisted_path = \"env.json\"\n").unwrap();
        let config = TestbedConfig::from_file(&path).unwrap();
        assert_eq!(config.persisted_path, Some(PathBuf::from("env.json")));
    }
}
