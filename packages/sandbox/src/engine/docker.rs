// ABOUTME: Docker implementation of the Engine trait for local sandboxes
// ABOUTME: Uses bollard to drive containers, exec sessions, tar archives and image builds

use super::{
    ContainerSpec, ContainerStats, ContainerSummary, Engine, EngineError, ExecOutput, ExecRequest,
    OutputMode, Result,
};
use crate::types::SandboxStatus;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
        StopContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::BuildImageOptions,
    models::{ContainerInspectResponse, HostConfig},
    Docker,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                message,
            } => EngineError::NotModified(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            other => EngineError::Connection(other.to_string()),
        }
    }
}

pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect using the platform defaults (unix socket or named pipe, honoring DOCKER_HOST)
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        Ok(Self { client })
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    /// Convert a container spec to bollard config
    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let limits = &spec.limits;

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_swap_bytes),
            cpu_quota: Some(limits.cpu_quota),
            cpu_period: Some(limits.cpu_period),
            network_mode: Some(limits.network_mode.clone()),
            cap_drop: Some(limits.cap_drop.clone()),
            security_opt: Some(limits.security_opt.clone()),
            privileged: Some(limits.privileged),
            readonly_rootfs: Some(limits.readonly_rootfs),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    fn summary_from_inspect(inspect: ContainerInspectResponse, requested: &str) -> ContainerSummary {
        let status = inspect
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|status| SandboxStatus::from_engine_state(&status.to_string()))
            .unwrap_or(SandboxStatus::Unknown);

        let created_at = inspect
            .created
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let image = inspect
            .config
            .as_ref()
            .and_then(|config| config.image.clone())
            .or(inspect.image)
            .unwrap_or_default();

        ContainerSummary {
            id: inspect.id.unwrap_or_else(|| requested.to_string()),
            name: inspect
                .name
                .unwrap_or_else(|| requested.to_string())
                .trim_start_matches('/')
                .to_string(),
            image,
            status,
            created_at,
        }
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, context_dir: &Path, dockerfile: &str, tag: &str) -> Result<()> {
        info!(image = tag, context = %context_dir.display(), "Building image");

        let context = context_dir.to_path_buf();
        let tar_data = tokio::task::spawn_blocking(move || create_tar_archive(&context))
            .await
            .map_err(|e| EngineError::Build(e.to_string()))??;

        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            pull: true,
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(tar_data.into()));

        while let Some(result) = stream.next().await {
            match result {
                Ok(build_info) => {
                    if let Some(line) = build_info.stream.as_deref().map(str::trim) {
                        if !line.is_empty() {
                            debug!("{}", line);
                        }
                    }
                    if let Some(error) = build_info.error {
                        error!(image = tag, "Image build failed: {}", error);
                        return Err(EngineError::Build(error));
                    }
                }
                Err(e) => return Err(EngineError::Build(e.to_string())),
            }
        }

        info!(image = tag, "Image built");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await?;

        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        info!("Starting container: {}", id);

        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(())
    }

    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<()> {
        info!("Stopping container: {} (timeout: {}s)", id, grace_secs);

        self.client
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await?;

        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.client.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerSummary> {
        let inspect = self.client.inspect_container(id_or_name, None).await?;
        Ok(Self::summary_from_inspect(inspect, id_or_name))
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", label)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());

                Some(ContainerSummary {
                    name,
                    image: c.image.unwrap_or_default(),
                    status: SandboxStatus::from_engine_state(c.state.as_deref().unwrap_or("")),
                    created_at: c
                        .created
                        .and_then(|secs| DateTime::from_timestamp(secs, 0))
                        .unwrap_or_else(Utc::now),
                    id,
                })
            })
            .collect())
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecOutput> {
        debug!("Executing command in container {}: {:?}", id, request.cmd);

        let exec_config = CreateExecOptions {
            cmd: Some(request.cmd.clone()),
            working_dir: request.working_dir.clone(),
            attach_stdin: Some(request.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(id, exec_config).await?;
        let start_result = self.client.start_exec(&exec.id, None).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                if let Some(data) = request.stdin.as_deref() {
                    input
                        .write_all(data)
                        .await
                        .map_err(|e| EngineError::Stream(e.to_string()))?;
                    input
                        .shutdown()
                        .await
                        .map_err(|e| EngineError::Stream(e.to_string()))?;
                }

                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdErr { message } => match request.output {
                            OutputMode::Separate => stderr.extend_from_slice(&message),
                            OutputMode::Combined => stdout.extend_from_slice(&message),
                        },
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Stream(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self.client.inspect_exec(&exec.id).await?;

        Ok(ExecOutput {
            exit_code: exec_inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut collected = String::new();

        while let Some(result) = stream.next().await {
            collected.push_str(&result?.to_string());
        }

        Ok(collected)
    }

    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        debug!("Downloading {} from container {}", path, id);

        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let mut stream = self.client.download_from_container(id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }

        Ok(data)
    }

    async fn put_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()> {
        debug!("Uploading archive to container {}:{}", id, dest_dir);

        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(id, Some(options), archive.into())
            .await?;

        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        // one_shot=false makes the daemon collect two samples so precpu is populated
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stats_stream = self.client.stats(id, Some(options));

        match stats_stream.next().await {
            Some(Ok(stats)) => Ok(ContainerStats {
                cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
                precpu_total_usage: stats.precpu_stats.cpu_usage.total_usage,
                system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
                presystem_cpu_usage: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
                online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1),
                memory_usage: stats.memory_stats.usage.unwrap_or(0),
                memory_limit: stats.memory_stats.limit.unwrap_or(0),
            }),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Stream(format!(
                "No stats returned for container {}",
                id
            ))),
        }
    }
}

/// Pack a build context directory into a tar archive
fn create_tar_archive(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", dir)?;
    archive.into_inner()
}
