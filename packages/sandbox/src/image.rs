// ABOUTME: Base image provisioning driven by a content hash of the Dockerfile
// ABOUTME: Rebuilds when the image is missing or the recipe changed and records the build descriptor

use crate::config::DockerConfig;
use crate::engine::Engine;
use crate::error::{Result, SandboxError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Record of the last successful image build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDescriptor {
    pub dockerfile_hash: String,
    pub build_time: DateTime<Utc>,
    pub image_name: String,
}

impl BuildDescriptor {
    /// Read a previous descriptor; unreadable or malformed files count as absent
    pub async fn load(path: &Path) -> Option<Self> {
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!("Ignoring unreadable build info {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await
    }
}

/// What `ensure_base_image` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    UpToDate,
    Built,
    /// The recipe is absent so the configured image name is used as-is
    RecipeMissing,
}

/// SHA-256 of the recipe file as lowercase hex
pub async fn recipe_hash(path: &Path) -> std::io::Result<String> {
    let contents = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

async fn recipe_changed(dockerfile: &Path, build_info: &Path) -> Result<bool> {
    let current = recipe_hash(dockerfile)
        .await
        .map_err(|e| SandboxError::io(format!("hashing {}", dockerfile.display()), e))?;

    match BuildDescriptor::load(build_info).await {
        Some(previous) if previous.dockerfile_hash == current => Ok(false),
        Some(previous) => {
            info!(
                previous = %previous.dockerfile_hash,
                current = %current,
                "Dockerfile changed since last build"
            );
            Ok(true)
        }
        None => {
            debug!("No previous build info at {}", build_info.display());
            Ok(true)
        }
    }
}

/// Make sure the configured base image exists and matches its recipe
pub async fn ensure_base_image(engine: &dyn Engine, config: &DockerConfig) -> Result<ImageOutcome> {
    let image = config.default_image.as_str();
    let dockerfile = config.dockerfile_path.as_path();

    let image_exists = match engine.image_exists(image).await {
        Ok(exists) => exists,
        Err(e) => {
            warn!(image, "Could not inspect image, assuming absent: {}", e);
            false
        }
    };
    let recipe_present = tokio::fs::try_exists(dockerfile).await.unwrap_or(false);

    let need_rebuild = if !image_exists {
        info!(image, "Sandbox image not found");
        true
    } else if config.check_dockerfile_changes && recipe_present {
        recipe_changed(dockerfile, &config.build_info_file).await?
    } else {
        false
    };

    if !need_rebuild {
        info!(image, "Sandbox image is up to date");
        return Ok(ImageOutcome::UpToDate);
    }

    if !recipe_present {
        warn!(
            image,
            "Dockerfile {} not found, using configured image as-is",
            dockerfile.display()
        );
        return Ok(ImageOutcome::RecipeMissing);
    }

    let context_dir = match dockerfile.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let recipe_name = dockerfile
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Dockerfile".to_string());

    engine
        .build_image(&context_dir, &recipe_name, image)
        .await
        .map_err(SandboxError::ImageBuild)?;

    if config.check_dockerfile_changes {
        match recipe_hash(dockerfile).await {
            Ok(dockerfile_hash) => {
                let descriptor = BuildDescriptor {
                    dockerfile_hash,
                    build_time: Utc::now(),
                    image_name: image.to_string(),
                };
                if let Err(e) = descriptor.save(&config.build_info_file).await {
                    warn!(
                        "Failed to save build info to {}: {}",
                        config.build_info_file.display(),
                        e
                    );
                } else {
                    info!("Build info saved to {}", config.build_info_file.display());
                }
            }
            Err(e) => warn!("Failed to hash {}: {}", dockerfile.display(), e),
        }
    }

    info!(image, "Sandbox image built");
    Ok(ImageOutcome::Built)
}
