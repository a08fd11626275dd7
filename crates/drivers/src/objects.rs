//! Builders for the cluster objects a session needs, plus the small pure
//! helpers for naming, routing and config parsing. Everything here is
//! deterministic and unit-tested; the drivers only add the API calls.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IPBlock, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer,
    NetworkPolicySpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use models::Session;

use crate::config::ClusterConfig;

/// Name of the workload container inside the session pod.
pub const SESSION_CONTAINER: &str = "session";

/// Label used to find a session's pod.
pub const SESSION_LABEL: &str = "name";

const SESSION_VOLUME: &str = "session-data";
const SESSION_VOLUME_SIZE: &str = "5Gi";

/// Private IPv4 ranges the session pods may not reach.
const BLOCKED_EGRESS_CIDRS: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// How a cluster exposes sessions to the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStyle {
    /// One shared hostname, sessions distinguished by path.
    PathBased,
    /// One subdomain per session, empty path.
    Subdomain,
}

impl RouteStyle {
    pub fn hostname(&self, session: &Session, app_domain: &str) -> String {
        match self {
            RouteStyle::PathBased => app_domain.to_string(),
            RouteStyle::Subdomain => format!("{}.{}", session.name, app_domain),
        }
    }

    pub fn path(&self, session: &Session) -> String {
        match self {
            RouteStyle::PathBased => format!("/notebooks/{}", session.id),
            RouteStyle::Subdomain => String::new(),
        }
    }

    pub fn endpoint_url(&self, session: &Session, protocol: &str, app_domain: &str) -> String {
        format!(
            "{}://{}{}",
            protocol,
            self.hostname(session, app_domain),
            self.path(session)
        )
    }
}

/// Parses a whitespace-separated `K=V` list, skipping malformed tokens:
/// no `=`, more than one `=`, or an empty key.
pub fn parse_env_vars(raw: &str) -> Vec<(String, String)> {
    raw.split_whitespace()
        .filter_map(|token| {
            let mut parts = token.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) if !key.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

/// Renders the args template, substituting `{session_id}`.
pub fn render_args(template: &str, session_id: &str) -> Vec<String> {
    template
        .replace("{session_id}", session_id)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Session-lifetime volume claim name.
pub fn session_volume_name(session: &Session) -> String {
    format!("pvc-{}-{}", session.user_pseudonym, session.name)
}

/// Namespace policy: sticky session data first, then a pinned namespace
/// from cluster config, then `<prefix><user_pseudonym>`.
pub fn select_namespace(cluster: &ClusterConfig, session: &Session) -> String {
    if let Some(data) = &session.session_data {
        if !data.namespace.is_empty() {
            return data.namespace.clone();
        }
    }
    if let Some(namespace) = &cluster.namespace {
        return namespace.clone();
    }
    format!("{}{}", cluster.namespace_prefix(), session.user_pseudonym)
}

fn session_labels(session: &Session) -> BTreeMap<String, String> {
    BTreeMap::from([(SESSION_LABEL.to_string(), session.name.clone())])
}

pub fn namespace_object(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Default policy for a session namespace: pods may talk to the world but
/// not to the private IPv4 networks the platform itself lives in.
pub fn network_policy_object() -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some("block-private-egress".to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            policy_types: Some(vec!["Egress".to_string()]),
            egress: Some(vec![NetworkPolicyEgressRule {
                to: Some(vec![NetworkPolicyPeer {
                    ip_block: Some(IPBlock {
                        cidr: "0.0.0.0/0".to_string(),
                        except: Some(
                            BLOCKED_EGRESS_CIDRS.iter().map(|c| c.to_string()).collect(),
                        ),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn volume_claim_object(
    name: &str,
    storage_class_name: Option<&str>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class_name.map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(SESSION_VOLUME_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deployment_object(session: &Session, cluster: &ClusterConfig) -> Deployment {
    let config = &session.provisioning_config;

    let mut env: Vec<EnvVar> = parse_env_vars(&config.environment_vars)
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();
    env.push(EnvVar {
        name: "SESSION_ID".to_string(),
        value: Some(session.id.clone()),
        ..Default::default()
    });

    let args = config
        .args
        .as_deref()
        .map(|template| render_args(template, &session.id));

    let memory = Quantity(config.memory_limit.clone());
    let resources = ResourceRequirements {
        requests: Some(BTreeMap::from([("memory".to_string(), memory.clone())])),
        limits: Some(BTreeMap::from([("memory".to_string(), memory)])),
        ..Default::default()
    };

    let container = Container {
        name: SESSION_CONTAINER.to_string(),
        image: Some(config.image.clone()),
        args,
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: config.port,
            ..Default::default()
        }]),
        resources: Some(resources),
        volume_mounts: Some(vec![VolumeMount {
            name: SESSION_VOLUME.to_string(),
            mount_path: config.volume_mount_path.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(session.name.clone()),
            labels: Some(session_labels(session)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(session_labels(session)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(session_labels(session)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    node_selector: cluster.node_selector.clone(),
                    volumes: Some(vec![Volume {
                        name: SESSION_VOLUME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: session_volume_name(session),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service_object(session: &Session) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(session.name.clone()),
            labels: Some(session_labels(session)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(session_labels(session)),
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(session.provisioning_config.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ingress_object(session: &Session, host: &str, path: &str) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(session.name.clone()),
            labels: Some(session_labels(session)),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: session.name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(80),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{ProvisioningConfig, SessionData, SessionState};

    fn session() -> Session {
        Session {
            id: "s-1234".to_string(),
            name: "pb-hardy-heron".to_string(),
            user_id: "u-1".to_string(),
            user_pseudonym: "hardy-heron".to_string(),
            application_id: "a-1".to_string(),
            state: SessionState::Queueing,
            to_be_deleted: false,
            log_fetch_pending: false,
            lifetime_left: 0,
            maximum_lifetime: 0,
            provisioning_config: ProvisioningConfig {
                cluster: Some("local_kubernetes".to_string()),
                image: "jupyter/minimal-notebook".to_string(),
                memory_limit: "1Gi".to_string(),
                environment_vars: "FOO=bar BROKEN NO=VAL=2 =empty OK=1".to_string(),
                args: Some("start.sh --base-url /notebooks/{session_id}".to_string()),
                port: 8888,
                volume_mount_path: "/home/jovyan/work".to_string(),
                endpoint_protocol: None,
            },
            session_data: None,
            created_at: None,
            provisioned_at: None,
            deprovisioned_at: None,
        }
    }

    #[test]
    fn malformed_env_tokens_are_skipped() {
        let vars = parse_env_vars("FOO=bar BROKEN NO=VAL=2 =empty OK=1");
        assert_eq!(
            vars,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("OK".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn args_template_substitutes_session_id() {
        let args = render_args("start.sh --base-url /notebooks/{session_id}", "s-1234");
        assert_eq!(args, vec!["start.sh", "--base-url", "/notebooks/s-1234"]);
    }

    #[test]
    fn volume_name_combines_pseudonym_and_session_name() {
        assert_eq!(session_volume_name(&session()), "pvc-hardy-heron-pb-hardy-heron");
    }

    #[test]
    fn path_based_routing_uses_shared_host() {
        let s = session();
        let url = RouteStyle::PathBased.endpoint_url(&s, "https", "notebooks.example.org");
        assert_eq!(url, "https://notebooks.example.org/notebooks/s-1234");
    }

    #[test]
    fn subdomain_routing_uses_per_session_host_and_empty_path() {
        let s = session();
        let url = RouteStyle::Subdomain.endpoint_url(&s, "https", "oso.example.org");
        assert_eq!(url, "https://pb-hardy-heron.oso.example.org");
    }

    #[test]
    fn namespace_selection_prefers_sticky_session_data() {
        let cluster = ClusterConfig {
            name: "c".to_string(),
            namespace: Some("pinned".to_string()),
            ..Default::default()
        };
        let mut s = session();
        s.session_data = Some(SessionData {
            namespace: "pb-existing".to_string(),
            endpoints: vec![],
        });
        assert_eq!(select_namespace(&cluster, &s), "pb-existing");

        s.session_data = None;
        assert_eq!(select_namespace(&cluster, &s), "pinned");

        let unpinned = ClusterConfig::default();
        assert_eq!(select_namespace(&unpinned, &s), "pb-hardy-heron");
    }

    #[test]
    fn deployment_sets_memory_request_equal_to_limit() {
        let s = session();
        let deployment = deployment_object(&s, &ClusterConfig::default());
        let container = &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        let resources = container.resources.as_ref().unwrap();
        let request = &resources.requests.as_ref().unwrap()["memory"];
        let limit = &resources.limits.as_ref().unwrap()["memory"];
        assert_eq!(request.0, "1Gi");
        assert_eq!(request, limit);
    }

    #[test]
    fn deployment_injects_session_id_env() {
        let s = session();
        let deployment = deployment_object(&s, &ClusterConfig::default());
        let container = &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(
            env.iter()
                .any(|e| e.name == "SESSION_ID" && e.value.as_deref() == Some("s-1234"))
        );
        assert!(env.iter().any(|e| e.name == "FOO"));
        assert_eq!(
            container.args.as_ref().unwrap().last().unwrap(),
            "/notebooks/s-1234"
        );
    }

    #[test]
    fn network_policy_blocks_private_ranges() {
        let policy = network_policy_object();
        let spec = policy.spec.unwrap();
        assert_eq!(spec.policy_types, Some(vec!["Egress".to_string()]));
        let egress = &spec.egress.unwrap()[0];
        let block = egress.to.as_ref().unwrap()[0].ip_block.as_ref().unwrap();
        assert_eq!(block.cidr, "0.0.0.0/0");
        let except = block.except.as_ref().unwrap();
        assert!(except.contains(&"10.0.0.0/8".to_string()));
        assert!(except.contains(&"172.16.0.0/12".to_string()));
        assert!(except.contains(&"192.168.0.0/16".to_string()));
    }

    #[test]
    fn ingress_routes_session_path_to_service() {
        let s = session();
        let ingress = ingress_object(&s, "notebooks.example.org", "/notebooks/s-1234");
        let rule = &ingress.spec.unwrap().rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("notebooks.example.org"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/notebooks/s-1234"));
        assert_eq!(path.path_type, "Prefix");
    }
}
