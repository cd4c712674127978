// ABOUTME: Sandbox engine configuration loaded from TOML with environment overrides
// ABOUTME: Every field has a default so a missing file still yields a usable config

use crate::engine::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Environment variable names that override file configuration
pub mod env_vars {
    pub const APP_HOST: &str = "APP_HOST";
    pub const APP_PORT: &str = "APP_PORT";
    pub const SANDBOX_BASE_URL: &str = "SANDBOX_BASE_URL";
    pub const SANDBOX_RESET_ALL: &str = "SANDBOX_RESET_ALL";
    pub const SANDBOX_IMAGE: &str = "SANDBOX_IMAGE";
    pub const SANDBOX_DOCKERFILE: &str = "SANDBOX_DOCKERFILE";
    pub const SANDBOX_DATA_DIR: &str = "SANDBOX_DATA_DIR";
    pub const SANDBOX_OPEN_MOUNT: &str = "SANDBOX_OPEN_MOUNT";
    pub const SANDBOX_MEM_LIMIT: &str = "SANDBOX_MEM_LIMIT";
    pub const SANDBOX_MEMSWAP_LIMIT: &str = "SANDBOX_MEMSWAP_LIMIT";
    pub const PYPI_INDEX_URL: &str = "PYPI_INDEX_URL";
    pub const SANDBOX_CONFIG: &str = "SANDBOX_CONFIG";
}

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Invalid memory limit: {0}")]
    InvalidMemoryLimit(String),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub mirror: MirrorConfig,
    pub execution: ExecutionConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Remove every labelled sandbox during startup
    pub reset_all_containers: bool,
    /// Base used when building file links; derived from the port when unset
    pub base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            reset_all_containers: false,
            base_url: None,
        }
    }
}

impl ServerConfig {
    pub fn public_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub default_image: String,
    pub dockerfile_path: PathBuf,
    pub check_dockerfile_changes: bool,
    pub build_info_file: PathBuf,
    /// Bind-mount `data_dir/<name>` into each sandbox's working directory
    pub open_mount_directory: bool,
    pub mem_limit: String,
    pub memswap_limit: String,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub network_mode: String,
    pub container_work_dir: String,
    pub data_dir: PathBuf,
    pub stop_timeout_secs: i64,
    /// Command that keeps an idle sandbox alive; empty keeps the image default
    pub keep_alive_command: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            default_image: "python-sandbox:latest".to_string(),
            dockerfile_path: PathBuf::from("sandbox_images/Dockerfile"),
            check_dockerfile_changes: true,
            build_info_file: PathBuf::from(".docker_build_info"),
            open_mount_directory: false,
            mem_limit: "1g".to_string(),
            memswap_limit: "1g".to_string(),
            cpu_quota: 50_000,
            cpu_period: 100_000,
            network_mode: "bridge".to_string(),
            container_work_dir: "/app/results".to_string(),
            data_dir: PathBuf::from("data"),
            stop_timeout_secs: 10,
            keep_alive_command: vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ],
        }
    }
}

impl DockerConfig {
    /// Resource ceiling applied to every sandbox
    pub fn resource_limits(&self) -> Result<ResourceLimits, ConfigError> {
        Ok(ResourceLimits {
            memory_bytes: parse_memory_limit(&self.mem_limit)?,
            memory_swap_bytes: parse_memory_limit(&self.memswap_limit)?,
            cpu_quota: self.cpu_quota,
            cpu_period: self.cpu_period,
            network_mode: self.network_mode.clone(),
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges".to_string()],
            privileged: false,
            readonly_rootfs: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub pypi_index_url: Option<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            pypi_index_url: Some("https://pypi.org/simple/".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub interpreter: String,
    /// Pause before each run so the previous run's writes settle below the start boundary
    pub settle_delay_ms: u64,
    pub install_command: String,
    pub inventory_command: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            settle_delay_ms: 1000,
            install_command: "uv pip install".to_string(),
            inventory_command: "pip list --format=json".to_string(),
        }
    }
}

impl ExecutionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            max_idle_secs: 3600,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

impl SandboxConfig {
    /// Load `path` (or `$SANDBOX_CONFIG`, or `config.toml`), then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => env::var(env_vars::SANDBOX_CONFIG)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let config = Self::from_toml_str(&raw)?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(env_vars::APP_HOST) {
            self.server.host = host;
        }

        if let Some(port) = lookup(env_vars::APP_PORT) {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: env_vars::APP_PORT,
                value: port.clone(),
            })?;
        }

        if let Some(url) = lookup(env_vars::SANDBOX_BASE_URL) {
            self.server.base_url = Some(url).filter(|u| !u.trim().is_empty());
        }

        if let Some(flag) = lookup(env_vars::SANDBOX_RESET_ALL) {
            self.server.reset_all_containers = parse_bool(env_vars::SANDBOX_RESET_ALL, &flag)?;
        }

        if let Some(image) = lookup(env_vars::SANDBOX_IMAGE) {
            self.docker.default_image = image;
        }

        if let Some(path) = lookup(env_vars::SANDBOX_DOCKERFILE) {
            self.docker.dockerfile_path = PathBuf::from(path);
        }

        if let Some(dir) = lookup(env_vars::SANDBOX_DATA_DIR) {
            self.docker.data_dir = PathBuf::from(dir);
        }

        if let Some(flag) = lookup(env_vars::SANDBOX_OPEN_MOUNT) {
            self.docker.open_mount_directory = parse_bool(env_vars::SANDBOX_OPEN_MOUNT, &flag)?;
        }

        if let Some(limit) = lookup(env_vars::SANDBOX_MEM_LIMIT) {
            self.docker.mem_limit = limit;
        }

        if let Some(limit) = lookup(env_vars::SANDBOX_MEMSWAP_LIMIT) {
            self.docker.memswap_limit = limit;
        }

        // An empty value disables the mirror argument entirely
        if let Some(url) = lookup(env_vars::PYPI_INDEX_URL) {
            self.mirror.pypi_index_url = Some(url).filter(|u| !u.trim().is_empty());
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::PortOutOfRange(self.server.port));
        }

        if self.docker.cpu_period <= 0 || self.docker.cpu_quota <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "docker.cpu_quota",
                value: format!("{}/{}", self.docker.cpu_quota, self.docker.cpu_period),
            });
        }

        if !self.docker.container_work_dir.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "docker.container_work_dir",
                value: self.docker.container_work_dir.clone(),
            });
        }

        if let Some(base) = &self.server.base_url {
            url::Url::parse(base).map_err(|_| ConfigError::InvalidValue {
                key: "server.base_url",
                value: base.clone(),
            })?;
        }

        self.docker.resource_limits()?;
        Ok(())
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

/// Parse a Docker-style memory size such as `512m` or `1g` into bytes
pub fn parse_memory_limit(value: &str) -> Result<i64, ConfigError> {
    let trimmed = value.trim().to_lowercase();
    let invalid = || ConfigError::InvalidMemoryLimit(value.to_string());

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(digits_end);

    let number: i64 = number.parse().map_err(|_| invalid())?;
    let multiplier: i64 = match unit.trim_end_matches('b') {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };

    let bytes = number.checked_mul(multiplier).ok_or_else(invalid)?;
    if bytes <= 0 {
        return Err(invalid());
    }
    Ok(bytes)
}
