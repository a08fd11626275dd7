//! Provisioning drivers.
//!
//! A driver owns the cluster-side I/O for sessions: creating the workload
//! objects, polling readiness, tearing things down and fetching container
//! logs. Drivers never talk to the control plane; they return values and the
//! controller patches session state through the API client. The set of
//! drivers is closed, selected by name from the cluster configuration.

use async_trait::async_trait;
use strum_macros::{Display, EnumString};
use thiserror::Error;

use models::{Session, SessionData, SessionState};

pub mod config;
mod dummy;
mod kubernetes;
mod objects;
mod openshift;
mod registry;

pub use config::{ClusterConfig, ClustersConfig, ConfigError, ImageBuildConfig};
pub use dummy::DummyDriver;
pub use kubernetes::KubernetesDriver;
pub use registry::DriverRegistry;

/// Closed set of driver names accepted in cluster configuration. Anything
/// else is a configuration error at first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum DriverKind {
    DummyDriver,
    KubernetesLocalDriver,
    KubernetesRemoteDriver,
    OpenShiftLocalDriver,
    OpenShiftRemoteDriver,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no cluster named {0} in configuration")]
    UnknownCluster(String),
    #[error("unknown driver {driver} for cluster {cluster}")]
    UnknownDriver { driver: String, cluster: String },
    #[error("cluster {cluster} is missing {field}")]
    IncompleteClusterConfig {
        cluster: String,
        field: &'static str,
    },
    #[error("invalid cluster url: {0}")]
    InvalidClusterUrl(String),
    #[error("token request to cluster {cluster} failed: {reason}")]
    TokenRequest { cluster: String, reason: String },
    #[error("session {0} takes too long to start")]
    StartupTimeout(String),
    #[error("expected one pod for selector {selector}, found {count}")]
    UnexpectedPodCount { selector: String, count: usize },
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    InCluster(#[from] kube::config::InClusterError),
    #[error(transparent)]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A noteworthy startup event, condensed from cluster events into a line the
/// session owner can understand.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupEvent {
    /// Unix epoch seconds.
    pub timestamp: f64,
    pub message: String,
}

/// Outcome of a readiness probe on a `starting` session.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// The workload answered ready; the driver hands back the session data
    /// to publish (namespace, endpoint URLs).
    Ready(SessionData),
    /// Not there yet. `event` carries the most recent startup event worth
    /// relaying to the session log, if any.
    Pending { event: Option<StartupEvent> },
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Creates the cluster objects for a queued session. Returns the state
    /// to publish: `Starting` when readiness must be polled asynchronously,
    /// `Running` when the workload is already observably up.
    async fn provision(&self, session: &Session) -> Result<SessionState, DriverError>;

    /// Polls a `starting` session once.
    async fn check_readiness(&self, session: &Session) -> Result<Readiness, DriverError>;

    /// Tears down everything `provision` created. Missing objects are
    /// success, so a worker can finish a teardown another worker started.
    async fn deprovision(&self, session: &Session) -> Result<(), DriverError>;

    /// Hook for drivers that manage connectivity rules per session.
    async fn update_connectivity(&self, _session: &Session) -> Result<(), DriverError> {
        Ok(())
    }

    /// Recent container logs for a running session, `None` when the driver
    /// has nothing to report.
    async fn fetch_running_logs(&self, session: &Session) -> Result<Option<String>, DriverError>;

    /// Periodic per-cluster work; may be a no-op.
    async fn housekeep(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// True when a cached credential is within its refresh window and the
    /// registry should build a fresh instance.
    fn is_expired(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_names_parse_exactly() {
        assert_eq!(
            "KubernetesRemoteDriver".parse::<DriverKind>().unwrap(),
            DriverKind::KubernetesRemoteDriver
        );
        assert_eq!(DriverKind::DummyDriver.to_string(), "DummyDriver");
        assert!("kubernetesremotedriver".parse::<DriverKind>().is_err());
        assert!("SlurmDriver".parse::<DriverKind>().is_err());
    }
}
