//! Custom image reconciliation. One global lock serialises all image work
//! across workers; builds run one at a time on the build cluster.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use api_client::ApiClient;
use build_client::{BuildClient, BuildError, render_dockerfile};
use models::{CustomImage, CustomImagePatch, CustomImageState};

use crate::{ControllerError, Pacing};

const CUSTOM_IMAGE_LOCK: &str = "custom-image-controller";

/// How many images are advanced per pass.
const IMAGE_LIST_LIMIT: usize = 1;

/// A build still not finished after this long is failed and cleaned up.
const BUILD_TIME_LIMIT_MINUTES: i64 = 15;

pub struct CustomImageController {
    worker_id: String,
    client: Arc<ApiClient>,
    build_client: Arc<dyn BuildClient>,
    allowed_base_images: Vec<String>,
    pacing: Pacing,
}

impl CustomImageController {
    pub fn new(
        worker_id: String,
        client: Arc<ApiClient>,
        build_client: Arc<dyn BuildClient>,
        allowed_base_images: Vec<String>,
    ) -> Self {
        Self {
            worker_id,
            client,
            build_client,
            allowed_base_images,
            pacing: Pacing::from_env("CUSTOM_IMAGE_CONTROLLER", 5, 20),
        }
    }

    pub async fn process(&mut self) -> Result<(), ControllerError> {
        if !self.pacing.due() {
            return Ok(());
        }
        self.pacing.schedule_next();

        if self.client.list_unfinished_custom_images().await?.is_empty() {
            return Ok(());
        }
        if !self
            .client
            .obtain_lock(CUSTOM_IMAGE_LOCK, &self.worker_id)
            .await?
        {
            debug!("another worker is processing custom images");
            return Ok(());
        }
        let result = self.process_images().await;
        self.client
            .release_lock(CUSTOM_IMAGE_LOCK, &self.worker_id)
            .await?;
        result
    }

    async fn process_images(&self) -> Result<(), ControllerError> {
        let images = self.client.list_custom_images(IMAGE_LIST_LIMIT).await?;
        for image in &images {
            if let Err(err) = self.process_image(image).await {
                warn!(image = %image.name, error = %err, "custom image processing failed");
                if let Err(patch_err) = self
                    .client
                    .patch_custom_image(&image.id, &CustomImagePatch::failed(err.to_string()))
                    .await
                {
                    warn!(image = %image.name, error = %patch_err, "could not mark image failed");
                }
            }
        }
        Ok(())
    }

    async fn process_image(&self, image: &CustomImage) -> Result<(), ControllerError> {
        if image.to_be_deleted {
            return self.delete_image(image).await;
        }
        match image.state {
            CustomImageState::New => self.start_build(image).await,
            CustomImageState::Building => self.poll_build(image).await,
            _ => Ok(()),
        }
    }

    async fn start_build(&self, image: &CustomImage) -> Result<(), ControllerError> {
        let dockerfile = match render_dockerfile(&image.definition, &self.allowed_base_images) {
            Ok(dockerfile) => dockerfile,
            Err(BuildError::InvalidDefinition(message)) => {
                // user error: record it on the image, submit nothing
                warn!(image = %image.name, %message, "image definition rejected");
                self.client
                    .patch_custom_image(&image.id, &CustomImagePatch::failed(message))
                    .await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let submission = self.build_client.post_build(&image.name, &dockerfile).await?;
        info!(
            image = %image.name,
            build = %submission.build_id,
            url = %submission.image_url(),
            "build submitted"
        );
        self.client
            .patch_custom_image(
                &image.id,
                &CustomImagePatch {
                    state: Some(CustomImageState::Building),
                    dockerfile: Some(dockerfile),
                    build_system_id: Some(submission.build_id.clone()),
                    tag: Some(submission.tag.clone()),
                    url: Some(submission.image_url()),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn poll_build(&self, image: &CustomImage) -> Result<(), ControllerError> {
        let Some(build_id) = image.build_system_id.as_deref() else {
            warn!(image = %image.name, "building image has no build handle");
            self.client
                .patch_custom_image(&image.id, &CustomImagePatch::failed("build handle missing"))
                .await?;
            return Ok(());
        };

        let status = self.build_client.get_build(build_id).await?;
        match status.as_ref().map(|s| s.phase.as_str()) {
            Some("Complete") => {
                info!(image = %image.name, build = %build_id, "build completed");
                self.build_client.delete_build(build_id).await?;
                self.client
                    .patch_custom_image(
                        &image.id,
                        &CustomImagePatch {
                            state: Some(CustomImageState::Completed),
                            completed_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Some("Failed") | Some("Error") | Some("Cancelled") => {
                let status = status.unwrap_or_default();
                warn!(image = %image.name, build = %build_id, phase = %status.phase, "build failed");
                self.build_client.delete_build(build_id).await?;
                let output = format!(
                    "{}\n{}",
                    status.message.unwrap_or_default(),
                    status.log_snippet.unwrap_or_default()
                );
                self.client
                    .patch_custom_image(&image.id, &CustomImagePatch::failed(output))
                    .await?;
            }
            phase => {
                if build_timed_out(image) {
                    warn!(image = %image.name, build = %build_id, "build timed out");
                    self.build_client.delete_build(build_id).await?;
                    self.client
                        .patch_custom_image(
                            &image.id,
                            &CustomImagePatch::failed("build did not finish in time"),
                        )
                        .await?;
                } else {
                    debug!(image = %image.name, ?phase, "build in progress");
                }
            }
        }
        Ok(())
    }

    async fn delete_image(&self, image: &CustomImage) -> Result<(), ControllerError> {
        info!(image = %image.name, "deleting custom image");
        if let Some(build_id) = image.build_system_id.as_deref() {
            self.build_client.delete_build(build_id).await?;
        }
        if let Some(tag) = image.tag.as_deref() {
            self.build_client.delete_tag(&image.name, tag).await?;
        }
        self.client
            .patch_custom_image(&image.id, &CustomImagePatch::state(CustomImageState::Deleted))
            .await?;
        Ok(())
    }
}

fn build_timed_out(image: &CustomImage) -> bool {
    match image.started_at {
        Some(started_at) => {
            Utc::now() - started_at > Duration::minutes(BUILD_TIME_LIMIT_MINUTES)
        }
        None => false,
    }
}
