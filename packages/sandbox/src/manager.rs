// ABOUTME: Sandbox lifecycle manager orchestrating image provisioning and container operations
// ABOUTME: Owns the registry and is the only component that calls engine lifecycle operations

use crate::config::SandboxConfig;
use crate::engine::{
    ContainerSpec, Engine, EngineError, ExecOutput, ExecRequest, ResourceLimits,
};
use crate::error::{Result, SandboxError};
use crate::image::ensure_base_image;
use crate::registry::{ClearedCounts, Registry};
use crate::types::{
    short_id, PackageInstallStatus, PackageStatusKey, Sandbox, SandboxDescriptor, SandboxStatus,
    SandboxSummary, SANDBOX_LABEL, SANDBOX_NAME_PREFIX,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lines of container output captured when an exited sandbox is restarted
const EXITED_LOG_TAIL: usize = 50;

/// Outcome of `reset_all`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub removed: Vec<String>,
    /// (sandbox name, error text)
    pub failed: Vec<(String, String)>,
    pub cleared: ClearedCounts,
}

impl ResetReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A sandbox known to be running, borrowed for the duration of one operation.
///
/// The handle cannot outlive the manager borrow, so it cannot be stashed
/// away and reused after the operation that acquired it.
pub struct RunningSandbox<'a> {
    manager: &'a SandboxManager,
    sandbox: Sandbox,
}

impl RunningSandbox<'_> {
    pub fn id(&self) -> &str {
        &self.sandbox.id
    }

    pub fn name(&self) -> &str {
        &self.sandbox.name
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub async fn exec(&self, request: ExecRequest) -> std::result::Result<ExecOutput, EngineError> {
        let output = self.manager.engine.exec(&self.sandbox.id, request).await;
        self.manager.registry.touch(&self.sandbox.id).await;
        output
    }

    pub async fn get_archive(&self, path: &str) -> std::result::Result<Vec<u8>, EngineError> {
        let archive = self.manager.engine.get_archive(&self.sandbox.id, path).await;
        self.manager.registry.touch(&self.sandbox.id).await;
        archive
    }

    pub async fn put_archive(
        &self,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> std::result::Result<(), EngineError> {
        let result = self
            .manager
            .engine
            .put_archive(&self.sandbox.id, dest_dir, archive)
            .await;
        self.manager.registry.touch(&self.sandbox.id).await;
        result
    }
}

/// Sandbox lifecycle manager
pub struct SandboxManager {
    engine: Arc<dyn Engine>,
    config: SandboxConfig,
    limits: ResourceLimits,
    registry: Registry,
}

impl SandboxManager {
    /// Connect, provision the base image, optionally reset, then reconcile the registry
    pub async fn initialize(engine: Arc<dyn Engine>, config: SandboxConfig) -> Result<Self> {
        if let Err(e) = engine.ping().await {
            error!("Container engine is not reachable: {}", e);
            return Err(SandboxError::EngineUnavailable(e));
        }

        match engine.version().await {
            Ok(version) => info!(version = %version, "Connected to container engine"),
            Err(e) => debug!("Could not read engine version: {}", e),
        }

        let limits = config
            .docker
            .resource_limits()
            .map_err(|e| SandboxError::Validation(e.to_string()))?;

        ensure_base_image(engine.as_ref(), &config.docker).await?;

        let manager = Self {
            engine,
            config,
            limits,
            registry: Registry::new(),
        };

        if manager.config.server.reset_all_containers {
            info!("Resetting all sandboxes on startup");
            manager.reset_all().await;
        }

        manager.reconcile().await;
        Ok(manager)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Host directory backing a sandbox's working directory
    pub fn data_dir(&self, sandbox_name: &str) -> PathBuf {
        self.config.docker.data_dir.join(sandbox_name)
    }

    /// Seed last-used timestamps for every labelled container
    async fn reconcile(&self) {
        match self.engine.list_containers(SANDBOX_LABEL).await {
            Ok(containers) => {
                for container in &containers {
                    self.registry.track(&container.id, &container.name).await;
                }
                info!("Tracking {} existing sandboxes", containers.len());
            }
            Err(e) => warn!("Failed to enumerate existing sandboxes: {}", e),
        }
    }

    /// Create and start a new sandbox
    pub async fn create_sandbox(&self, name: Option<&str>) -> Result<SandboxDescriptor> {
        let image = self.config.docker.default_image.clone();

        match self.engine.image_exists(&image).await {
            Ok(true) => {}
            Ok(false) => {
                error!(image = %image, "Sandbox image does not exist");
                return Err(SandboxError::ImageNotFound(image));
            }
            Err(e) => {
                return Err(SandboxError::engine(format!("checking image {}", image), e));
            }
        }

        let name = container_name(name)?;
        let work_dir = self.config.docker.container_work_dir.clone();

        let mut binds = Vec::new();
        if self.config.docker.open_mount_directory {
            let dir = self.data_dir(&name);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SandboxError::io(format!("creating {}", dir.display()), e))?;
            let absolute = tokio::fs::canonicalize(&dir)
                .await
                .map_err(|e| SandboxError::io(format!("resolving {}", dir.display()), e))?;
            binds.push(format!("{}:{}:rw", absolute.display(), work_dir));
        }

        let keep_alive = &self.config.docker.keep_alive_command;
        let spec = ContainerSpec {
            name: name.clone(),
            image: image.clone(),
            labels: HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())]),
            working_dir: Some(work_dir),
            command: (!keep_alive.is_empty()).then(|| keep_alive.clone()),
            binds,
            limits: self.limits.clone(),
        };

        info!(name = %name, image = %image, "Creating sandbox");

        let id = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(source) => {
                error!(name = %name, "Failed to create sandbox: {}", source);
                return Err(SandboxError::CreateFailed {
                    name,
                    image,
                    source,
                });
            }
        };

        if let Err(source) = self.engine.start_container(&id).await {
            error!(name = %name, "Failed to start sandbox: {}", source);
            if let Err(e) = self.engine.remove_container(&id, true).await {
                warn!(sandbox_id = %short_id(&id), "Failed to remove unstarted sandbox: {}", e);
            }
            return Err(SandboxError::CreateFailed {
                name,
                image,
                source,
            });
        }

        self.registry.track(&id, &name).await;
        info!(name = %name, sandbox_id = %short_id(&id), "Sandbox created");

        Ok(SandboxDescriptor {
            sandbox_id: id,
            sandbox_name: name,
            status: "active".to_string(),
        })
    }

    /// Look up a sandbox by id or name and refresh its last-used time
    pub async fn resolve(&self, id_or_name: &str) -> Result<Sandbox> {
        let id_or_name = id_or_name.trim();
        if id_or_name.is_empty() {
            return Err(SandboxError::Validation(
                "sandbox id must not be empty".to_string(),
            ));
        }

        let summary = match self.engine.inspect_container(id_or_name).await {
            Ok(summary) => summary,
            Err(e) if e.is_not_found() => {
                return Err(SandboxError::SandboxNotFound(id_or_name.to_string()))
            }
            Err(e) => {
                return Err(SandboxError::engine(
                    format!("looking up sandbox {}", id_or_name),
                    e,
                ))
            }
        };

        self.registry.track(&summary.id, &summary.name).await;
        let last_used = self.registry.last_used(&summary.id).await;

        Ok(Sandbox {
            id: summary.id,
            name: summary.name,
            status: summary.status,
            image: summary.image,
            created_at: summary.created_at,
            last_used,
        })
    }

    /// Resolve a sandbox and make sure it is running, restarting it when needed
    pub async fn acquire_running(&self, id_or_name: &str) -> Result<RunningSandbox<'_>> {
        let mut sandbox = self.resolve(id_or_name).await?;

        if !sandbox.status.is_running() {
            if sandbox.status == SandboxStatus::Exited {
                match self.engine.logs(&sandbox.id, EXITED_LOG_TAIL).await {
                    Ok(logs) => warn!(
                        sandbox_id = %sandbox.short_id(),
                        "Sandbox had exited, last output:\n{}",
                        logs
                    ),
                    Err(e) => debug!("Could not read logs for {}: {}", sandbox.short_id(), e),
                }
            }

            info!(sandbox_id = %sandbox.short_id(), status = %sandbox.status, "Starting sandbox");
            self.engine
                .start_container(&sandbox.id)
                .await
                .map_err(|source| SandboxError::Lifecycle {
                    sandbox: sandbox.id.clone(),
                    action: "start",
                    source,
                })?;

            let refreshed = self
                .engine
                .inspect_container(&sandbox.id)
                .await
                .map_err(|e| SandboxError::engine(format!("refreshing {}", sandbox.id), e))?;
            if !refreshed.status.is_running() {
                return Err(SandboxError::NotRunning {
                    sandbox: sandbox.id,
                    status: refreshed.status,
                });
            }
            sandbox.status = refreshed.status;
        }

        self.registry.touch(&sandbox.id).await;
        sandbox.last_used = self.registry.last_used(&sandbox.id).await;

        Ok(RunningSandbox {
            manager: self,
            sandbox,
        })
    }

    /// Tar archive of `path` inside a sandbox, running or not
    pub(crate) async fn archive(&self, id_or_name: &str, path: &str) -> Result<Vec<u8>> {
        let sandbox = self.resolve(id_or_name).await?;

        let archive = match self.engine.get_archive(&sandbox.id, path).await {
            Ok(archive) => archive,
            Err(e) if e.is_not_found() => return Err(SandboxError::FileNotFound(path.to_string())),
            Err(e) => {
                return Err(SandboxError::FileAccess {
                    path: path.to_string(),
                    message: e.to_string(),
                })
            }
        };

        self.registry.touch(&sandbox.id).await;
        Ok(archive)
    }

    /// Stop and remove a sandbox. Absence counts as success.
    pub async fn delete_sandbox(&self, id_or_name: &str) -> bool {
        let id_or_name = id_or_name.trim();
        if id_or_name.is_empty() {
            warn!("Refusing to delete a sandbox with an empty id");
            return false;
        }

        let summary = match self.engine.inspect_container(id_or_name).await {
            Ok(summary) => summary,
            Err(e) if e.is_not_found() => {
                info!(sandbox = %id_or_name, "Sandbox already removed");
                self.registry.forget(id_or_name).await;
                return true;
            }
            Err(e) => {
                error!(sandbox = %id_or_name, "Failed to look up sandbox for deletion: {}", e);
                self.registry.forget(id_or_name).await;
                return false;
            }
        };

        let deleted = self.stop_and_remove(&summary.id, summary.status).await;
        match &deleted {
            Ok(()) => info!(sandbox_id = %short_id(&summary.id), name = %summary.name, "Sandbox deleted"),
            Err(e) => error!(sandbox_id = %short_id(&summary.id), "Failed to delete sandbox: {}", e),
        }

        self.registry.forget(&summary.id).await;
        if summary.id != id_or_name {
            self.registry.forget(id_or_name).await;
        }

        deleted.is_ok()
    }

    async fn stop_and_remove(&self, id: &str, status: SandboxStatus) -> std::result::Result<(), EngineError> {
        if status.is_running() {
            match self
                .engine
                .stop_container(id, self.config.docker.stop_timeout_secs)
                .await
            {
                Ok(()) | Err(EngineError::NotModified(_)) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => warn!(sandbox_id = %short_id(id), "Stop failed, forcing removal: {}", e),
            }
        }

        match self.engine.remove_container(id, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove every labelled sandbox and its data directory, then clear the registry
    pub async fn reset_all(&self) -> ResetReport {
        let mut report = ResetReport::default();

        match self.engine.list_containers(SANDBOX_LABEL).await {
            Ok(containers) => {
                for container in containers {
                    match self.stop_and_remove(&container.id, container.status).await {
                        Ok(()) => report.removed.push(container.name.clone()),
                        Err(e) => report.failed.push((container.name.clone(), e.to_string())),
                    }

                    let data_dir = self.data_dir(&container.name);
                    if tokio::fs::try_exists(&data_dir).await.unwrap_or(false) {
                        if let Err(e) = tokio::fs::remove_dir_all(&data_dir).await {
                            warn!("Failed to remove {}: {}", data_dir.display(), e);
                        }
                    }
                }
            }
            Err(e) => error!("Failed to enumerate sandboxes for reset: {}", e),
        }

        report.cleared = self.registry.clear().await;

        if report.all_succeeded() {
            info!("Reset removed all {} sandboxes", report.removed.len());
        } else {
            let names: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
            warn!(
                "Reset removed {} sandboxes, {} failed: {}",
                report.removed.len(),
                report.failed.len(),
                names.join(", ")
            );
        }

        report
    }

    /// Every labelled sandbox with its CPU usage; sandboxes without readable stats are skipped
    pub async fn list_sandboxes(&self) -> Result<Vec<SandboxSummary>> {
        let containers = self
            .engine
            .list_containers(SANDBOX_LABEL)
            .await
            .map_err(|e| SandboxError::engine("listing sandboxes", e))?;

        let mut summaries = Vec::with_capacity(containers.len());
        for container in containers {
            let cpu = match self.engine.stats(&container.id).await {
                Ok(stats) => stats.cpu_percent(),
                Err(e) => {
                    info!(sandbox_id = %short_id(&container.id), "Skipping sandbox without stats: {}", e);
                    continue;
                }
            };

            summaries.push(SandboxSummary {
                sandbox_short_id: short_id(&container.id).to_string(),
                last_used: self.registry.last_used(&container.id).await,
                sandbox_id: container.id,
                name: container.name,
                status: container.status,
                image: container.image,
                created: container.created_at,
                cpu,
            });
        }

        Ok(summaries)
    }

    /// Live details of one sandbox, `None` when it does not exist
    pub async fn sandbox_info(&self, id_or_name: &str) -> Result<Option<Sandbox>> {
        match self.engine.inspect_container(id_or_name).await {
            Ok(summary) => Ok(Some(Sandbox {
                last_used: self.registry.last_used(&summary.id).await,
                id: summary.id,
                name: summary.name,
                status: summary.status,
                image: summary.image,
                created_at: summary.created_at,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(SandboxError::engine(
                format!("inspecting sandbox {}", id_or_name),
                e,
            )),
        }
    }

    /// Associate a caller session with a sandbox
    pub async fn bind_session(&self, session_key: &str, id_or_name: &str) -> Result<()> {
        let sandbox = self.resolve(id_or_name).await?;
        self.registry.bind_session(session_key, &sandbox.id).await;
        Ok(())
    }

    pub async fn session_sandbox(&self, session_key: &str) -> Option<String> {
        self.registry.session(session_key).await
    }

    pub async fn package_status(
        &self,
        sandbox_id: &str,
        key: &PackageStatusKey,
    ) -> Option<PackageInstallStatus> {
        self.registry.package_status(sandbox_id, key).await
    }

    pub(crate) async fn record_package_status<I>(&self, sandbox_id: &str, records: I)
    where
        I: IntoIterator<Item = (PackageStatusKey, PackageInstallStatus)>,
    {
        self.registry.record_packages(sandbox_id, records).await;
    }

    /// Delete every tracked sandbox unused for longer than `max_idle`
    pub async fn cleanup_idle(&self, max_idle: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for id in self.registry.idle_before(cutoff).await {
            // Earlier deletions can take a while; skip sandboxes used since the snapshot
            if !self.registry.is_idle(&id, cutoff).await {
                continue;
            }
            if self.delete_sandbox(&id).await {
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            info!("Removed {} idle sandboxes", removed.len());
        }
        removed
    }
}

/// Full container name for a requested sandbox name
fn container_name(requested: Option<&str>) -> Result<String> {
    let base = match requested.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => {
            let valid = name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !valid {
                return Err(SandboxError::Validation(format!(
                    "invalid sandbox name {:?}: only letters, digits, '_', '.' and '-' are allowed",
                    name
                )));
            }
            name.to_string()
        }
        None => Uuid::new_v4().simple().to_string()[..8].to_string(),
    };

    if base.starts_with(SANDBOX_NAME_PREFIX) {
        Ok(base)
    } else {
        Ok(format!("{}{}", SANDBOX_NAME_PREFIX, base))
    }
}
