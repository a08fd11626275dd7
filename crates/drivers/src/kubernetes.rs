//! The Kubernetes-family drivers. One struct covers all four variants: the
//! flavour decides ingress vs. route and namespace creation, the constructor
//! decides where credentials come from.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Namespace, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use models::{Endpoint, Session, SessionData, SessionState};

use crate::config::ClusterConfig;
use crate::objects::{self, RouteStyle, SESSION_CONTAINER, SESSION_LABEL};
use crate::{Driver, DriverError, Readiness, StartupEvent, openshift};

/// A session still not ready this long after creation is failed.
const SESSION_STARTUP_TIME_LIMIT: Duration = Duration::from_secs(15 * 60);

/// Replace a cached cluster token this close to its expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(600);

/// Startup events older than this are stale and not worth relaying.
const EVENT_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClusterFlavour {
    Kubernetes,
    OpenShift,
}

pub struct KubernetesDriver {
    client: Client,
    cluster: ClusterConfig,
    flavour: ClusterFlavour,
    /// Local drivers operate inside one namespace only.
    fixed_namespace: Option<String>,
    /// Epoch seconds; set by the OpenShift remote token exchange.
    token_expires_at: Option<i64>,
}

impl KubernetesDriver {
    /// In-cluster service account, plain Kubernetes objects.
    pub async fn kubernetes_local(cluster: ClusterConfig) -> Result<Self, DriverError> {
        let config = Config::incluster()?;
        let namespace = config.default_namespace.clone();
        debug!(cluster = %cluster.name, %namespace, "using in-cluster service account");
        Ok(Self {
            client: Client::try_from(config)?,
            cluster,
            flavour: ClusterFlavour::Kubernetes,
            fixed_namespace: Some(namespace),
            token_expires_at: None,
        })
    }

    /// Remote cluster via a kubeconfig context matching the cluster name.
    pub async fn kubernetes_remote(
        cluster: ClusterConfig,
        kubeconfig_path: &Path,
    ) -> Result<Self, DriverError> {
        let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig_path)?;
        let options = KubeConfigOptions {
            context: Some(cluster.name.clone()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        debug!(cluster = %cluster.name, path = %kubeconfig_path.display(), "loaded kubeconfig context");
        Ok(Self {
            client: Client::try_from(config)?,
            cluster,
            flavour: ClusterFlavour::Kubernetes,
            fixed_namespace: None,
            token_expires_at: None,
        })
    }

    /// In-cluster service account on OpenShift.
    pub async fn openshift_local(cluster: ClusterConfig) -> Result<Self, DriverError> {
        let config = Config::incluster()?;
        let namespace = config.default_namespace.clone();
        Ok(Self {
            client: Client::try_from(config)?,
            cluster,
            flavour: ClusterFlavour::OpenShift,
            fixed_namespace: Some(namespace),
            token_expires_at: None,
        })
    }

    /// Remote OpenShift with a token from the cluster's OAuth server.
    pub async fn openshift_remote(cluster: ClusterConfig) -> Result<Self, DriverError> {
        let url = cluster
            .url
            .clone()
            .ok_or_else(|| DriverError::IncompleteClusterConfig {
                cluster: cluster.name.clone(),
                field: "url",
            })?;
        let user = cluster
            .user
            .clone()
            .ok_or_else(|| DriverError::IncompleteClusterConfig {
                cluster: cluster.name.clone(),
                field: "user",
            })?;
        let password =
            cluster
                .password
                .clone()
                .ok_or_else(|| DriverError::IncompleteClusterConfig {
                    cluster: cluster.name.clone(),
                    field: "password",
                })?;

        let token = openshift::request_token(&cluster.name, &url, &user, &password).await?;
        info!(cluster = %cluster.name, expires_at = token.expires_at, "obtained cluster token");

        let uri: http::Uri = url
            .parse()
            .map_err(|_| DriverError::InvalidClusterUrl(url.clone()))?;
        let mut config = Config::new(uri);
        config.auth_info.token = Some(SecretString::from(token.access_token));

        Ok(Self {
            client: Client::try_from(config)?,
            cluster,
            flavour: ClusterFlavour::OpenShift,
            fixed_namespace: None,
            token_expires_at: Some(token.expires_at),
        })
    }

    fn route_style(&self) -> RouteStyle {
        match self.flavour {
            ClusterFlavour::Kubernetes => RouteStyle::PathBased,
            ClusterFlavour::OpenShift => RouteStyle::Subdomain,
        }
    }

    fn app_domain(&self) -> &str {
        self.cluster.app_domain.as_deref().unwrap_or("localhost")
    }

    fn namespace_for(&self, session: &Session) -> String {
        if let Some(namespace) = &self.fixed_namespace {
            return namespace.clone();
        }
        objects::select_namespace(&self.cluster, session)
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, DriverError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(namespace).await {
            Ok(_) => Ok(true),
            // RBAC-restricted clusters answer 403 for namespaces that do
            // not exist, so both codes read as absent
            Err(kube::Error::Api(resp)) if resp.code == 404 || resp.code == 403 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), DriverError> {
        if self.namespace_exists(namespace).await? {
            return Ok(());
        }
        info!(%namespace, "creating namespace");
        match self.flavour {
            ClusterFlavour::Kubernetes => {
                let namespaces: Api<Namespace> = Api::all(self.client.clone());
                namespaces
                    .create(&PostParams::default(), &objects::namespace_object(namespace))
                    .await?;
                let policies: Api<NetworkPolicy> =
                    Api::namespaced(self.client.clone(), namespace);
                policies
                    .create(&PostParams::default(), &objects::network_policy_object())
                    .await?;
            }
            ClusterFlavour::OpenShift => {
                openshift::project_request_api(self.client.clone())
                    .create(
                        &PostParams::default(),
                        &openshift::project_request_object(namespace),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn ensure_volume(&self, namespace: &str, session: &Session) -> Result<(), DriverError> {
        let name = objects::session_volume_name(session);
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match claims.get(&name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(%namespace, volume = %name, "creating session volume");
                claims
                    .create(
                        &PostParams::default(),
                        &objects::volume_claim_object(
                            &name,
                            self.cluster.storage_class_name.as_deref(),
                        ),
                    )
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_route(&self, namespace: &str, session: &Session) -> Result<(), DriverError> {
        let style = self.route_style();
        let host = style.hostname(session, self.app_domain());
        match self.flavour {
            ClusterFlavour::Kubernetes => {
                let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                ingresses
                    .create(
                        &PostParams::default(),
                        &objects::ingress_object(session, &host, &style.path(session)),
                    )
                    .await?;
            }
            ClusterFlavour::OpenShift => {
                openshift::route_api(self.client.clone(), namespace)
                    .create(
                        &PostParams::default(),
                        &openshift::route_object(session, &host),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_route(&self, namespace: &str, session: &Session) -> Result<(), DriverError> {
        let params = DeleteParams::default();
        match self.flavour {
            ClusterFlavour::Kubernetes => {
                let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                ignore_not_found(ingresses.delete(&session.name, &params).await)?;
            }
            ClusterFlavour::OpenShift => {
                let routes = openshift::route_api(self.client.clone(), namespace);
                ignore_not_found(routes.delete(&session.name, &params).await)?;
            }
        }
        Ok(())
    }

    async fn find_session_pod(
        &self,
        namespace: &str,
        session: &Session,
    ) -> Result<Vec<Pod>, DriverError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{SESSION_LABEL}={}", session.name);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn latest_startup_event(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<StartupEvent>, DriverError> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let list = events
            .list(&ListParams::default().fields(&format!("involvedObject.name={pod_name}")))
            .await?;

        let cutoff = Utc::now().timestamp() as f64 - EVENT_MAX_AGE.as_secs() as f64;
        let mut latest = None;
        for event in list.items {
            let timestamp = event
                .first_timestamp
                .as_ref()
                .map(|t| t.0.timestamp() as f64)
                .or_else(|| event.event_time.as_ref().map(|t| t.0.timestamp() as f64));
            let Some(timestamp) = timestamp else { continue };
            if timestamp < cutoff {
                continue;
            }
            let Some(message) = condense_event_message(event.message.as_deref().unwrap_or(""))
            else {
                continue;
            };
            latest = Some(StartupEvent {
                timestamp,
                message: message.to_string(),
            });
        }
        Ok(latest)
    }
}

#[async_trait]
impl Driver for KubernetesDriver {
    async fn provision(&self, session: &Session) -> Result<SessionState, DriverError> {
        let namespace = self.namespace_for(session);
        self.ensure_namespace(&namespace).await?;
        self.ensure_volume(&namespace, session).await?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        deployments
            .create(
                &PostParams::default(),
                &objects::deployment_object(session, &self.cluster),
            )
            .await?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        services
            .create(&PostParams::default(), &objects::service_object(session))
            .await?;

        self.create_route(&namespace, session).await?;

        // the pod comes up asynchronously, ask to be polled
        Ok(SessionState::Starting)
    }

    async fn check_readiness(&self, session: &Session) -> Result<Readiness, DriverError> {
        if startup_deadline_exceeded(session) {
            return Err(DriverError::StartupTimeout(session.id.clone()));
        }

        let namespace = self.namespace_for(session);
        let pods = self.find_session_pod(&namespace, session).await?;
        let pod = match pods.as_slice() {
            [] => return Ok(Readiness::Pending { event: None }),
            [pod] => pod,
            pods => {
                warn!(
                    session = %session.name,
                    count = pods.len(),
                    "expected one pod for session, rechecking next tick"
                );
                return Ok(Readiness::Pending { event: None });
            }
        };

        if pod_is_ready(pod) {
            let style = self.route_style();
            let access =
                style.endpoint_url(session, self.cluster.endpoint_protocol(), self.app_domain());
            return Ok(Readiness::Ready(SessionData {
                namespace,
                endpoints: vec![Endpoint {
                    name: "https".to_string(),
                    access,
                }],
            }));
        }

        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let event = self.latest_startup_event(&namespace, &pod_name).await?;
        Ok(Readiness::Pending { event })
    }

    async fn deprovision(&self, session: &Session) -> Result<(), DriverError> {
        let namespace = self.namespace_for(session);
        let params = DeleteParams::default();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        ignore_not_found(deployments.delete(&session.name, &params).await)?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        ignore_not_found(services.delete(&session.name, &params).await)?;

        self.delete_route(&namespace, session).await?;

        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        ignore_not_found(
            claims
                .delete(&objects::session_volume_name(session), &params)
                .await,
        )?;

        Ok(())
    }

    async fn fetch_running_logs(&self, session: &Session) -> Result<Option<String>, DriverError> {
        let namespace = self.namespace_for(session);
        let pods = self.find_session_pod(&namespace, session).await?;
        let [pod] = pods.as_slice() else {
            warn!(session = %session.name, count = pods.len(), "no single pod for log fetch");
            return Ok(None);
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let logs = api
            .logs(
                &pod_name,
                &LogParams {
                    container: Some(SESSION_CONTAINER.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(if logs.is_empty() { None } else { Some(logs) })
    }

    fn is_expired(&self) -> bool {
        match self.token_expires_at {
            Some(expires_at) => {
                expires_at - Utc::now().timestamp() < TOKEN_EXPIRY_MARGIN.as_secs() as i64
            }
            None => false,
        }
    }
}

/// Sessions without a creation timestamp never hit the ceiling.
fn startup_deadline_exceeded(session: &Session) -> bool {
    match session.created_at {
        Some(created_at) => {
            Utc::now().timestamp() - created_at.timestamp()
                > SESSION_STARTUP_TIME_LIMIT.as_secs() as i64
        }
        None => false,
    }
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .map(|statuses| statuses.iter().all(|s| s.ready))
        .unwrap_or(false)
}

/// Turns a raw cluster event message into a line a session owner can act on.
fn condense_event_message(message: &str) -> Option<&'static str> {
    if message.contains("assigned") {
        return Some("scheduled to a node");
    }
    if message.contains("ulling image") {
        return Some("pulling container image");
    }
    if message.contains("olume") {
        return Some("waiting for volumes");
    }
    if message.contains("eadiness probe") || message.contains("reated container") {
        return Some("starting");
    }
    for needle in ["ErrImagePull", "ImagePullBackOff", "Failed to pull image"] {
        if message.contains(needle) {
            return Some("image could not be pulled");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    #[test]
    fn event_messages_condense_to_user_facing_lines() {
        assert_eq!(
            condense_event_message("Successfully assigned pb-x/pod to node-3"),
            Some("scheduled to a node")
        );
        assert_eq!(
            condense_event_message("Pulling image \"jupyter/minimal-notebook\""),
            Some("pulling container image")
        );
        assert_eq!(
            condense_event_message("AttachVolume.Attach succeeded for volume"),
            Some("waiting for volumes")
        );
        assert_eq!(
            condense_event_message("Readiness probe failed: connection refused"),
            Some("starting")
        );
        assert_eq!(
            condense_event_message("Created container session"),
            Some("starting")
        );
        assert_eq!(
            condense_event_message("Error: ErrImagePull"),
            Some("image could not be pulled")
        );
        assert_eq!(condense_event_message("something unrelated"), None);
    }

    fn session_created_minutes_ago(minutes: Option<i64>) -> Session {
        let mut session: Session = serde_json::from_value(serde_json::json!({
            "id": "s-1",
            "name": "pb-x",
            "user_id": "u",
            "application_id": "a",
            "state": "starting",
            "provisioning_config": {
                "cluster": "c",
                "image": "img",
                "memory_limit": "1Gi",
                "port": 8888,
                "volume_mount_path": "/home/jovyan/work"
            }
        }))
        .unwrap();
        session.created_at = minutes.map(|m| Utc::now() - chrono::Duration::minutes(m));
        session
    }

    #[test]
    fn startup_ceiling_is_fifteen_minutes_from_creation() {
        assert!(!startup_deadline_exceeded(&session_created_minutes_ago(None)));
        assert!(!startup_deadline_exceeded(&session_created_minutes_ago(Some(5))));
        assert!(startup_deadline_exceeded(&session_created_minutes_ago(Some(16))));
    }

    fn pod_with(phase: &str, ready: &[bool]) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    ready
                        .iter()
                        .map(|&ready| ContainerStatus {
                            ready,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_readiness_requires_running_phase_and_ready_containers() {
        assert!(pod_is_ready(&pod_with("Running", &[true, true])));
        assert!(!pod_is_ready(&pod_with("Running", &[true, false])));
        assert!(!pod_is_ready(&pod_with("Pending", &[true])));
        assert!(!pod_is_ready(&Pod::default()));
    }
}
