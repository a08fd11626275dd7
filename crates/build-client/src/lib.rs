//! Client for the image-build subsystem.
//!
//! Custom images are built on an OpenShift cluster: a disposable
//! BuildConfig per build, results pushed to an ImageStream tag in the
//! configured registry. The backend sits behind the [`BuildClient`] trait so
//! controllers can be tested without a cluster.

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use kube::{Client, Config};
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use drivers::ImageBuildConfig;

mod dockerfile;

pub use dockerfile::render_dockerfile;

#[derive(Debug, Error)]
pub enum BuildError {
    /// User-facing validation failure; the message is stored on the image.
    #[error("{0}")]
    InvalidDefinition(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    InCluster(#[from] kube::config::InClusterError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// What the build system hands back on submit.
#[derive(Debug, Clone)]
pub struct BuildSubmission {
    pub build_id: String,
    pub registry: String,
    pub repo: String,
    pub name: String,
    pub tag: String,
}

impl BuildSubmission {
    /// Full pullable reference for the image being built.
    pub fn image_url(&self) -> String {
        format!(
            "{}/{}/{}:{}",
            self.registry, self.repo, self.name, self.tag
        )
    }
}

/// Condensed state of one build.
#[derive(Debug, Clone, Default)]
pub struct BuildStatus {
    /// OpenShift build phase: `New`, `Pending`, `Running`, `Complete`,
    /// `Failed`, `Error` or `Cancelled`.
    pub phase: String,
    pub message: Option<String>,
    pub log_snippet: Option<String>,
}

#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Submits a Dockerfile under a disposable build name.
    async fn post_build(&self, name: &str, dockerfile: &str) -> Result<BuildSubmission, BuildError>;

    /// Current status of a submitted build, `None` when no build object
    /// exists (yet, or any more).
    async fn get_build(&self, build_id: &str) -> Result<Option<BuildStatus>, BuildError>;

    /// Removes the build object; a missing build counts as removed.
    async fn delete_build(&self, build_id: &str) -> Result<(), BuildError>;

    /// Removes a built tag; a missing tag counts as removed.
    async fn delete_tag(&self, name: &str, tag: &str) -> Result<(), BuildError>;
}

/// Disposable build name: the image name plus 12 random lowercase letters.
fn disposable_build_name(name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..12).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
    format!("{name}-{suffix}")
}

/// Image tags are the UTC submit time, `YYYYMMDDHHMMSS`.
fn build_tag() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

fn build_config_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("build.openshift.io", "v1", "BuildConfig"))
}

pub struct OpenShiftBuildClient {
    client: Client,
    namespace: String,
    registry: String,
    repo: String,
}

impl OpenShiftBuildClient {
    /// Connects with the worker's own service account; the worker is
    /// expected to run in (or have RBAC into) the build cluster.
    pub fn in_cluster(config: &ImageBuildConfig) -> Result<Self, BuildError> {
        let kube_config = Config::incluster()?;
        Ok(Self::with_client(
            Client::try_from(kube_config)?,
            config,
        ))
    }

    pub fn with_client(client: Client, config: &ImageBuildConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            registry: config.registry.clone(),
            repo: config.repo.clone(),
        }
    }

    fn build_config_api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &build_config_resource())
    }

    fn build_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("build.openshift.io", "v1", "Build");
        Api::namespaced_with(self.client.clone(), &self.namespace, &ApiResource::from_gvk(&gvk))
    }

    fn image_stream_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("image.openshift.io", "v1", "ImageStream");
        Api::namespaced_with(self.client.clone(), &self.namespace, &ApiResource::from_gvk(&gvk))
    }

    fn image_stream_tag_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("image.openshift.io", "v1", "ImageStreamTag");
        Api::namespaced_with(self.client.clone(), &self.namespace, &ApiResource::from_gvk(&gvk))
    }

    async fn ensure_image_stream(&self, name: &str) -> Result<(), BuildError> {
        let api = self.image_stream_api();
        match api.get(name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                info!(image_stream = %name, "creating image stream");
                let gvk = GroupVersionKind::gvk("image.openshift.io", "v1", "ImageStream");
                let stream = DynamicObject::new(name, &ApiResource::from_gvk(&gvk));
                api.create(&PostParams::default(), &stream).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl BuildClient for OpenShiftBuildClient {
    async fn post_build(&self, name: &str, dockerfile: &str) -> Result<BuildSubmission, BuildError> {
        self.ensure_image_stream(name).await?;

        let build_id = disposable_build_name(name);
        let tag = build_tag();

        let mut build_config = DynamicObject::new(&build_id, &build_config_resource()).data(json!({
            "spec": {
                "output": {
                    "to": {"kind": "ImageStreamTag", "name": format!("{name}:{tag}")}
                },
                "source": {"dockerfile": dockerfile},
                "strategy": {"type": "docker", "dockerStrategy": {}},
                "resources": {
                    "limits": {"cpu": "1", "memory": "1Gi"},
                    "requests": {"cpu": "1", "memory": "1Gi"},
                },
            }
        }));
        build_config.metadata.labels = Some([("source".to_string(), "build-proxy".to_string())].into());

        let api = self.build_config_api();
        api.create(&PostParams::default(), &build_config).await?;

        let build_request = json!({
            "kind": "BuildRequest",
            "apiVersion": "build.openshift.io/v1",
            "metadata": {"name": build_id},
            "triggeredBy": [{"message": "Triggered by build-proxy"}],
        });
        let _: DynamicObject = api
            .create_subresource(
                "instantiate",
                &build_id,
                &PostParams::default(),
                serde_json::to_vec(&build_request)?,
            )
            .await?;

        debug!(%build_id, %tag, "build submitted");
        Ok(BuildSubmission {
            build_id,
            registry: self.registry.clone(),
            repo: self.repo.clone(),
            name: name.to_string(),
            tag,
        })
    }

    async fn get_build(&self, build_id: &str) -> Result<Option<BuildStatus>, BuildError> {
        let builds = self
            .build_api()
            .list(&ListParams::default().labels(&format!("buildconfig={build_id}")))
            .await?;
        let Some(build) = builds.items.first() else {
            return Ok(None);
        };
        let status = &build.data["status"];
        Ok(Some(BuildStatus {
            phase: status["phase"].as_str().unwrap_or_default().to_string(),
            message: status["message"].as_str().map(str::to_string),
            log_snippet: status["logSnippet"].as_str().map(str::to_string),
        }))
    }

    async fn delete_build(&self, build_id: &str) -> Result<(), BuildError> {
        match self
            .build_config_api()
            .delete(build_id, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_tag(&self, name: &str, tag: &str) -> Result<(), BuildError> {
        match self
            .image_stream_tag_api()
            .delete(&format!("{name}:{tag}"), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_names_append_twelve_lowercase_letters() {
        let name = disposable_build_name("data-science");
        let suffix = name.strip_prefix("data-science-").unwrap();
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));

        // two submissions never share a name
        assert_ne!(name, disposable_build_name("data-science"));
    }

    #[test]
    fn tags_are_utc_timestamps() {
        let tag = build_tag();
        assert_eq!(tag.len(), 14);
        assert!(tag.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn image_url_combines_registry_repo_name_and_tag() {
        let submission = BuildSubmission {
            build_id: "img-abcdefghijkl".to_string(),
            registry: "image-registry.example.org".to_string(),
            repo: "pb-images".to_string(),
            name: "img".to_string(),
            tag: "20260829120000".to_string(),
        };
        assert_eq!(
            submission.image_url(),
            "image-registry.example.org/pb-images/img:20260829120000"
        );
    }
}
