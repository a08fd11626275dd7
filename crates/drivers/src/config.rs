//! Cluster configuration, loaded from a YAML file plus a separate secrets
//! file so credentials can be mounted independently of the config map.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_NAMESPACE_PREFIX: &str = "pb-";
const DEFAULT_ENDPOINT_PROTOCOL: &str = "http";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One cluster the worker can drive. Credentials arrive through the secrets
/// file and are merged in at load time.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClusterConfig {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub app_domain: Option<String>,
    #[serde(default)]
    pub endpoint_protocol: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub namespace_prefix: Option<String>,
    #[serde(default)]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub disable_alerts: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(skip)]
    pub monitoring_token: Option<String>,
}

impl ClusterConfig {
    pub fn namespace_prefix(&self) -> &str {
        self.namespace_prefix
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE_PREFIX)
    }

    pub fn endpoint_protocol(&self) -> &str {
        self.endpoint_protocol
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT_PROTOCOL)
    }
}

/// Where custom images get built: the build cluster and namespace, the
/// registry the results land in, and the base images users may start from.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ImageBuildConfig {
    /// Cluster the builds run on. The worker is deployed into this cluster
    /// and the build client authenticates with its local service account;
    /// the name here is not used to open a separate connection.
    pub cluster: String,
    pub namespace: String,
    pub registry: String,
    pub repo: String,
    #[serde(default)]
    pub allowed_base_images: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClustersConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub image_builds: Option<ImageBuildConfig>,
}

/// Secrets file entries are either a bare password or a map with a password
/// and a monitoring token.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SecretEntry {
    Password(String),
    Detailed {
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        monitoring_token: Option<String>,
    },
}

impl ClustersConfig {
    pub fn load(path: &Path, secrets_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: ClustersConfig = parse_yaml_file(path)?;
        if let Some(secrets_path) = secrets_path {
            let secrets: BTreeMap<String, SecretEntry> = parse_yaml_file(secrets_path)?;
            config.merge_secrets(secrets);
        }
        Ok(config)
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    fn merge_secrets(&mut self, mut secrets: BTreeMap<String, SecretEntry>) {
        for cluster in &mut self.clusters {
            match secrets.remove(&cluster.name) {
                Some(SecretEntry::Password(password)) => {
                    cluster.password = Some(password);
                }
                Some(SecretEntry::Detailed {
                    password,
                    monitoring_token,
                }) => {
                    cluster.password = password;
                    cluster.monitoring_token = monitoring_token;
                }
                None => {}
            }
        }
        for name in secrets.keys() {
            warn!(cluster = %name, "secrets entry does not match any configured cluster");
        }
    }
}

fn parse_yaml_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const CLUSTERS_YAML: &str = r#"
clusters:
  - name: local_kubernetes
    driver: KubernetesLocalDriver
    app_domain: notebooks.example.org
    endpoint_protocol: https
  - name: remote_openshift
    driver: OpenShiftRemoteDriver
    url: https://api.oso.example.org:6443
    app_domain: oso.example.org
    user: pb-worker
    disable_alerts: true
image_builds:
  cluster: remote_openshift
  namespace: pb-builds
  registry: image-registry.oso.example.org
  repo: pb-images
  allowed_base_images:
    - quay.io/jupyter/minimal-notebook:latest
"#;

    #[test]
    fn clusters_and_image_builds_parse() {
        let file = write_temp(CLUSTERS_YAML);
        let config = ClustersConfig::load(file.path(), None).unwrap();

        assert_eq!(config.clusters.len(), 2);
        let local = config.cluster("local_kubernetes").unwrap();
        assert_eq!(local.driver, "KubernetesLocalDriver");
        assert_eq!(local.endpoint_protocol(), "https");
        assert_eq!(local.namespace_prefix(), "pb-");
        assert!(!local.disable_alerts);

        let builds = config.image_builds.as_ref().unwrap();
        assert_eq!(builds.cluster, "remote_openshift");
        assert_eq!(builds.allowed_base_images.len(), 1);
    }

    #[test]
    fn secrets_merge_supports_both_entry_shapes() {
        let clusters = write_temp(CLUSTERS_YAML);
        let secrets = write_temp(
            r#"
local_kubernetes: plain-password
remote_openshift:
  password: detailed-password
  monitoring_token: monitoring-secret
"#,
        );
        let config = ClustersConfig::load(clusters.path(), Some(secrets.path())).unwrap();

        let local = config.cluster("local_kubernetes").unwrap();
        assert_eq!(local.password.as_deref(), Some("plain-password"));
        assert_eq!(local.monitoring_token, None);

        let remote = config.cluster("remote_openshift").unwrap();
        assert_eq!(remote.password.as_deref(), Some("detailed-password"));
        assert_eq!(remote.monitoring_token.as_deref(), Some("monitoring-secret"));
    }

    #[test]
    fn unknown_cluster_lookup_is_none() {
        let file = write_temp(CLUSTERS_YAML);
        let config = ClustersConfig::load(file.path(), None).unwrap();
        assert!(config.cluster("missing").is_none());
    }
}
