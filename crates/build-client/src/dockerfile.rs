//! Dockerfile rendering for custom images. User input is a base image plus
//! package lists; everything is validated before a single line is rendered,
//! so nothing shell-unsafe ever reaches a build.

use std::sync::LazyLock;

use regex::Regex;

use models::{ImageContentKind, ImageDefinition};

use crate::BuildError;

static APT_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9\-+.=~]+$").unwrap());
static PIP_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\-_.=]+$").unwrap());

const DEFAULT_IMAGE_USER: &str = "jovyan";

fn validate_apt_package(package: &str) -> Result<(), BuildError> {
    let package = package.trim();
    if !APT_PACKAGE.is_match(package) {
        return Err(BuildError::InvalidDefinition(format!(
            "invalid apt package: {package}"
        )));
    }
    Ok(())
}

fn validate_pip_package(package: &str) -> Result<(), BuildError> {
    let package = package.trim();
    if !PIP_PACKAGE.is_match(package) {
        return Err(BuildError::InvalidDefinition(format!(
            "invalid pip package: {package}"
        )));
    }
    Ok(())
}

fn validate_base_image(base_image: &str, allowed: &[String]) -> Result<(), BuildError> {
    if base_image.is_empty() {
        return Err(BuildError::InvalidDefinition(
            "base_image cannot be empty".to_string(),
        ));
    }
    if !allowed.iter().any(|image| image == base_image) {
        return Err(BuildError::InvalidDefinition(format!(
            "invalid base image: {base_image}"
        )));
    }
    Ok(())
}

/// Validates a definition and renders it to a Dockerfile. `allowed` is the
/// set of base images users may currently start from.
pub fn render_dockerfile(
    definition: &ImageDefinition,
    allowed: &[String],
) -> Result<String, BuildError> {
    validate_base_image(&definition.base_image, allowed)?;

    let user = definition.user.as_deref().unwrap_or(DEFAULT_IMAGE_USER);
    let mut lines = vec![format!("FROM {}", definition.base_image)];

    for content in &definition.image_content {
        if content.data.is_empty() {
            return Err(BuildError::InvalidDefinition(format!(
                "{} definition must have non-empty \"data\" field",
                kind_name(content.kind)
            )));
        }
        match content.kind {
            ImageContentKind::AptPackages => {
                for package in content.data.split(' ') {
                    validate_apt_package(package)?;
                }
                lines.push(String::new());
                lines.push("# aptPackages".to_string());
                lines.push("USER root".to_string());
                lines.push(format!(
                    "RUN apt-get update && apt-get install -y {} && apt-get clean",
                    content.data
                ));
                lines.push(format!("USER {user}"));
            }
            ImageContentKind::PipPackages => {
                for package in content.data.split(' ') {
                    validate_pip_package(package)?;
                }
                lines.push(String::new());
                lines.push("# pipPackages".to_string());
                lines.push(format!(
                    "RUN pip --no-cache-dir install --upgrade {}",
                    content.data
                ));
            }
            ImageContentKind::CondaForgePackages => {
                // pip package rules also cover conda-forge names
                for package in content.data.split(' ') {
                    validate_pip_package(package)?;
                }
                lines.push(String::new());
                lines.push("# condaForgePackages".to_string());
                lines.push(format!(
                    "RUN conda install -c conda-forge --yes {}",
                    content.data
                ));
            }
        }
    }

    Ok(lines.join("\n"))
}

fn kind_name(kind: ImageContentKind) -> &'static str {
    match kind {
        ImageContentKind::AptPackages => "aptPackages",
        ImageContentKind::PipPackages => "pipPackages",
        ImageContentKind::CondaForgePackages => "condaForgePackages",
    }
}
