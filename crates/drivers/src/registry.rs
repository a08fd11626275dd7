//! Per-worker driver cache. Building a driver can mean a token exchange, so
//! instances are reused until they age out or report their token expiring.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::ClustersConfig;
use crate::dummy::DummyDriver;
use crate::kubernetes::KubernetesDriver;
use crate::{Driver, DriverError, DriverKind};

const DRIVER_CACHE_LIFETIME: Duration = Duration::from_secs(900);

struct CachedDriver {
    instance: Arc<dyn Driver>,
    created_at: Instant,
}

pub struct DriverRegistry {
    clusters: ClustersConfig,
    /// Kubeconfig with one context per remote Kubernetes cluster.
    kubeconfig_path: Option<PathBuf>,
    cache: RwLock<HashMap<String, CachedDriver>>,
}

impl DriverRegistry {
    pub fn new(clusters: ClustersConfig, kubeconfig_path: Option<PathBuf>) -> Self {
        Self {
            clusters,
            kubeconfig_path,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn clusters(&self) -> &ClustersConfig {
        &self.clusters
    }

    /// Registers a prebuilt driver instance under a cluster name, bypassing
    /// configuration lookup. The instance is still subject to the normal
    /// cache aging rules.
    pub async fn register(&self, cluster_name: &str, instance: Arc<dyn Driver>) {
        self.cache.write().await.insert(
            cluster_name.to_string(),
            CachedDriver {
                instance,
                created_at: Instant::now(),
            },
        );
    }

    pub async fn driver_for(&self, cluster_name: &str) -> Result<Arc<dyn Driver>, DriverError> {
        if let Some(cached) = self.cache.read().await.get(cluster_name) {
            if cached.created_at.elapsed() < DRIVER_CACHE_LIFETIME && !cached.instance.is_expired()
            {
                return Ok(cached.instance.clone());
            }
            debug!(cluster = %cluster_name, "cached driver aged out");
        }

        let cluster = self
            .clusters
            .cluster(cluster_name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownCluster(cluster_name.to_string()))?;
        let kind: DriverKind =
            cluster
                .driver
                .parse()
                .map_err(|_| DriverError::UnknownDriver {
                    driver: cluster.driver.clone(),
                    cluster: cluster_name.to_string(),
                })?;

        debug!(cluster = %cluster_name, driver = %kind, "creating driver instance");
        let instance: Arc<dyn Driver> = match kind {
            DriverKind::DummyDriver => Arc::new(DummyDriver::new(cluster)),
            DriverKind::KubernetesLocalDriver => {
                Arc::new(KubernetesDriver::kubernetes_local(cluster).await?)
            }
            DriverKind::KubernetesRemoteDriver => {
                let path = self.kubeconfig_path.as_deref().ok_or_else(|| {
                    DriverError::IncompleteClusterConfig {
                        cluster: cluster_name.to_string(),
                        field: "kubeconfig",
                    }
                })?;
                Arc::new(KubernetesDriver::kubernetes_remote(cluster, path).await?)
            }
            DriverKind::OpenShiftLocalDriver => {
                Arc::new(KubernetesDriver::openshift_local(cluster).await?)
            }
            DriverKind::OpenShiftRemoteDriver => {
                Arc::new(KubernetesDriver::openshift_remote(cluster).await?)
            }
        };

        self.cache.write().await.insert(
            cluster_name.to_string(),
            CachedDriver {
                instance: instance.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn registry() -> DriverRegistry {
        DriverRegistry::new(
            ClustersConfig {
                clusters: vec![
                    ClusterConfig {
                        name: "dummy".to_string(),
                        driver: "DummyDriver".to_string(),
                        ..Default::default()
                    },
                    ClusterConfig {
                        name: "typo".to_string(),
                        driver: "KubernetesLoclaDriver".to_string(),
                        ..Default::default()
                    },
                ],
                image_builds: None,
            },
            None,
        )
    }

    #[tokio::test]
    async fn dummy_driver_instances_are_cached() {
        let registry = registry();
        let first = registry.driver_for("dummy").await.unwrap();
        let second = registry.driver_for("dummy").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn registered_instances_take_precedence_over_config() {
        let registry = registry();
        let driver: Arc<dyn Driver> = Arc::new(DummyDriver::new(ClusterConfig::default()));
        registry.register("unconfigured", driver.clone()).await;

        let resolved = registry.driver_for("unconfigured").await.unwrap();
        assert!(Arc::ptr_eq(&driver, &resolved));
    }

    #[tokio::test]
    async fn unknown_cluster_is_an_error() {
        let registry = registry();
        match registry.driver_for("missing").await {
            Err(DriverError::UnknownCluster(name)) => assert_eq!(name, "missing"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn misspelled_driver_name_is_an_error() {
        let registry = registry();
        match registry.driver_for("typo").await {
            Err(DriverError::UnknownDriver { driver, cluster }) => {
                assert_eq!(driver, "KubernetesLoclaDriver");
                assert_eq!(cluster, "typo");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }
}
