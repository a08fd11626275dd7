//! Worker configuration, taken from the environment the deployment injects.

use std::path::PathBuf;

use anyhow::Context;
use rand::Rng;

pub struct Settings {
    pub api_base_url: String,
    pub api_key: String,
    pub worker_id: String,
    pub cluster_config_file: PathBuf,
    pub cluster_passwords_file: Option<PathBuf>,
    pub kubeconfig_file: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            api_base_url: require("INTERNAL_API_BASE_URL")?,
            api_key: require("SECRET_KEY")?,
            worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| random_worker_id()),
            cluster_config_file: require("CLUSTER_CONFIG_FILE")?.into(),
            cluster_passwords_file: optional("CLUSTER_PASSWORDS_FILE").map(Into::into),
            kubeconfig_file: optional("KUBECONFIG_FILE").map(Into::into),
        })
    }
}

fn require(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Workers without an assigned id pick a random one so several replicas can
/// share a control plane without lock collisions.
fn random_worker_id() -> String {
    format!("worker-{}", rand::thread_rng().gen_range(100..u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_worker_ids_are_prefixed_and_unique() {
        let id = random_worker_id();
        assert!(id.starts_with("worker-"));
        assert_ne!(id, random_worker_id());
    }

    #[test]
    fn missing_required_variable_is_a_clear_error() {
        let err = require("WORKER_TEST_UNSET_VARIABLE").unwrap_err();
        assert!(err.to_string().contains("WORKER_TEST_UNSET_VARIABLE"));
    }
}
