//! A driver that pretends to provision things, for development and for
//! exercising the controllers without a cluster.

use async_trait::async_trait;
use tracing::info;

use models::{Endpoint, Session, SessionData, SessionState};

use crate::config::ClusterConfig;
use crate::objects::RouteStyle;
use crate::{Driver, DriverError, Readiness};

pub struct DummyDriver {
    cluster: ClusterConfig,
}

impl DummyDriver {
    pub fn new(cluster: ClusterConfig) -> Self {
        Self { cluster }
    }

    fn app_domain(&self) -> &str {
        self.cluster.app_domain.as_deref().unwrap_or("localhost")
    }
}

#[async_trait]
impl Driver for DummyDriver {
    async fn provision(&self, session: &Session) -> Result<SessionState, DriverError> {
        info!(session = %session.name, "dummy provisioning");
        Ok(SessionState::Starting)
    }

    async fn check_readiness(&self, session: &Session) -> Result<Readiness, DriverError> {
        let access = RouteStyle::PathBased.endpoint_url(
            session,
            self.cluster.endpoint_protocol(),
            self.app_domain(),
        );
        Ok(Readiness::Ready(SessionData {
            namespace: "dummy".to_string(),
            endpoints: vec![Endpoint {
                name: "https".to_string(),
                access,
            }],
        }))
    }

    async fn deprovision(&self, session: &Session) -> Result<(), DriverError> {
        info!(session = %session.name, "dummy deprovisioning");
        Ok(())
    }

    async fn fetch_running_logs(&self, _session: &Session) -> Result<Option<String>, DriverError> {
        Ok(Some("dummy running logs".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::ProvisioningConfig;

    fn session() -> Session {
        Session {
            id: "s-9".to_string(),
            name: "pb-dummy".to_string(),
            user_id: "u".to_string(),
            user_pseudonym: "dummy-user".to_string(),
            application_id: "a".to_string(),
            state: SessionState::Queueing,
            to_be_deleted: false,
            log_fetch_pending: false,
            lifetime_left: 0,
            maximum_lifetime: 0,
            provisioning_config: ProvisioningConfig::default(),
            session_data: None,
            created_at: None,
            provisioned_at: None,
            deprovisioned_at: None,
        }
    }

    #[tokio::test]
    async fn dummy_sessions_become_ready_on_first_probe() {
        let driver = DummyDriver::new(ClusterConfig {
            name: "dummy".to_string(),
            driver: "DummyDriver".to_string(),
            app_domain: Some("example.org".to_string()),
            ..Default::default()
        });

        let state = driver.provision(&session()).await.unwrap();
        assert_eq!(state, SessionState::Starting);

        match driver.check_readiness(&session()).await.unwrap() {
            Readiness::Ready(data) => {
                assert_eq!(data.namespace, "dummy");
                assert_eq!(data.endpoints[0].access, "http://example.org/notebooks/s-9");
            }
            Readiness::Pending { .. } => panic!("dummy driver should be ready"),
        }
    }
}
