use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CustomImageState {
    #[default]
    New,
    Building,
    Completed,
    Failed,
    Deleted,
}

/// Package list kinds a user may request in an image definition. The set is
/// closed; anything else fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageContentKind {
    #[serde(rename = "aptPackages")]
    AptPackages,
    #[serde(rename = "pipPackages")]
    PipPackages,
    #[serde(rename = "condaForgePackages")]
    CondaForgePackages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub kind: ImageContentKind,
    /// Whitespace-separated package names, optionally version-pinned.
    pub data: String,
}

/// User-declared image recipe, validated and rendered to a Dockerfile by the
/// build client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageDefinition {
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub image_content: Vec<ImageContent>,
}

/// A workspace-scoped container image built from a vetted base image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomImage {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub state: CustomImageState,
    #[serde(default)]
    pub definition: ImageDefinition,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    /// Full pullable reference, `<registry>/<repo>/<name>:<tag>`.
    #[serde(default)]
    pub url: Option<String>,
    /// Handle the build system returned on submit.
    #[serde(default)]
    pub build_system_id: Option<String>,
    #[serde(default)]
    pub build_system_output: Option<String>,
    #[serde(default)]
    pub to_be_deleted: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Partial update for PATCH `/custom_images/{id}`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CustomImagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CustomImageState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_system_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_system_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CustomImagePatch {
    pub fn state(state: CustomImageState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            state: Some(CustomImageState::Failed),
            build_system_output: Some(output.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}
