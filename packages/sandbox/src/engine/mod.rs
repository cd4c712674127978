// ABOUTME: Engine trait describing the container engine capabilities sandboxes rely on
// ABOUTME: Lifecycle, exec, tar archive transfer, image build and stats behind one interface

use crate::types::SandboxStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub mod docker;

#[cfg(test)]
pub(crate) mod mock;

pub use docker::DockerEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not modified: {0}")]
    NotModified(String),

    #[error("Engine API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Image build error: {0}")]
    Build(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Archive error: {0}")]
    Archive(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Resource ceiling applied to every sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub readonly_rootfs: bool,
}

/// Everything needed to create one sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// Overrides the image's default command when set
    pub command: Option<Vec<String>>,
    /// Bind mounts in `host:container:mode` form
    pub binds: Vec<String>,
    pub limits: ResourceLimits,
}

/// Engine view of one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// stdout and stderr captured into separate buffers
    Separate,
    /// stderr folded into stdout in arrival order
    Combined,
}

/// One exec call inside a container
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub stdin: Option<Vec<u8>>,
    pub output: OutputMode,
}

impl ExecRequest {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            working_dir: None,
            stdin: None,
            output: OutputMode::Separate,
        }
    }

    /// Run `script` through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn combined(mut self) -> Self {
        self.output = OutputMode::Combined;
        self
    }
}

/// Result of an exec call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Two consecutive CPU samples plus memory figures for one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub presystem_cpu_usage: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

impl ContainerStats {
    /// CPU usage in percent of one core, derived from the sample deltas
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu_total_usage as f64 - self.precpu_total_usage as f64;
        let system_delta = self.system_cpu_usage as f64 - self.presystem_cpu_usage as f64;

        if system_delta > 0.0 && cpu_delta > 0.0 {
            (cpu_delta / system_delta) * self.online_cpus.max(1) as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// Capability surface of the container engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Check that the engine answers
    async fn ping(&self) -> Result<()>;

    /// Engine version string
    async fn version(&self) -> Result<String>;

    /// Check if an image exists locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build `tag` from the recipe `dockerfile` inside `context_dir`
    async fn build_image(&self, context_dir: &Path, dockerfile: &str, tag: &str) -> Result<()>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a running container, waiting at most `grace_secs` before killing it
    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Look up a container by id or name
    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerSummary>;

    /// List all containers (running or not) carrying `label=true`
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>>;

    /// Execute a command in a running container
    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecOutput>;

    /// Last `tail` lines of container output
    async fn logs(&self, id: &str, tail: usize) -> Result<String>;

    /// Tar archive of `path` inside the container
    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    /// Unpack a tar archive into `dest_dir` inside the container
    async fn put_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()>;

    async fn stats(&self, id: &str) -> Result<ContainerStats>;
}
