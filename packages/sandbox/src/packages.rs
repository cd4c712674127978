// ABOUTME: Package installation and inventory queries inside sandboxes
// ABOUTME: One installer call per batch; per-package and batch records share its outcome

use crate::engine::ExecRequest;
use crate::manager::SandboxManager;
use crate::types::{InstallState, PackageInstallStatus, PackageStatusKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Installed state of one requested package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePresence {
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Live inventory check for a set of package names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageCheckReport {
    pub status: InstallState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub packages: BTreeMap<String, PackagePresence>,
}

impl PackageCheckReport {
    fn failed(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: InstallState::Failed,
            message: message.into(),
            stderr: Some(stderr.into()),
            packages: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
struct InventoryEntry {
    name: String,
    version: String,
}

/// Quote one argument for `sh -c`
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub struct PackageInstaller {
    manager: Arc<SandboxManager>,
}

impl PackageInstaller {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }

    fn install_command(&self, names: &[String]) -> String {
        let config = self.manager.config();
        let mut command = config.execution.install_command.clone();
        if let Some(index_url) = &config.mirror.pypi_index_url {
            command.push_str(" --index-url ");
            command.push_str(&shell_quote(index_url));
        }
        for name in names {
            command.push(' ');
            command.push_str(&shell_quote(name));
        }
        command
    }

    /// Install every name with a single installer invocation and record the outcome
    pub async fn install(&self, sandbox_id: &str, names: &[String]) -> PackageInstallStatus {
        let names: Vec<String> = names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();

        if names.is_empty() {
            return PackageInstallStatus::failed(
                "No packages requested",
                "package list must not be empty",
            )
            .with_packages(names);
        }

        let sandbox = match self.manager.acquire_running(sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!(sandbox = %sandbox_id, "Cannot install packages: {}", e);
                return PackageInstallStatus::failed(
                    format!("Failed to install packages: {}", e),
                    e.to_string(),
                )
                .with_packages(names);
            }
        };

        let command = self.install_command(&names);
        let joined = names.join(" ");
        info!(sandbox_id = %sandbox.sandbox().short_id(), "Installing packages: {}", joined);

        let (per_package, batch): (Vec<_>, PackageInstallStatus) =
            match sandbox.exec(ExecRequest::shell(&command).combined()).await {
                Ok(output) => {
                    let text = output.stdout_lossy();
                    info!(exit_code = output.exit_code, "Installer output:\n{}", text);
                    if output.success() {
                        (
                            names
                                .iter()
                                .map(|name| {
                                    PackageInstallStatus::succeeded(format!("Successfully installed {}", name))
                                })
                                .collect(),
                            PackageInstallStatus::succeeded(format!("Successfully installed packages: {}", joined)),
                        )
                    } else {
                        (
                            names
                                .iter()
                                .map(|name| {
                                    PackageInstallStatus::failed(
                                        format!("Failed to install {}: {}", name, text),
                                        text.clone(),
                                    )
                                })
                                .collect(),
                            PackageInstallStatus::failed(
                                format!("Failed to install packages: {}", text),
                                text.clone(),
                            ),
                        )
                    }
                }
                Err(e) => {
                    error!(sandbox_id = %sandbox.sandbox().short_id(), "Installer exec failed: {}", e);
                    let message = e.to_string();
                    (
                        names
                            .iter()
                            .map(|name| {
                                PackageInstallStatus::failed(
                                    format!("Failed to install {}: {}", name, message),
                                    message.clone(),
                                )
                            })
                            .collect(),
                        PackageInstallStatus::failed(
                            format!("Failed to install packages: {}", message),
                            message.clone(),
                        ),
                    )
                }
            };

        let batch = batch.with_packages(names.clone());
        let records = names
            .iter()
            .map(PackageStatusKey::package)
            .zip(per_package)
            .chain(std::iter::once((PackageStatusKey::Batch, batch.clone())));
        self.manager
            .record_package_status(sandbox.id(), records)
            .await;

        batch
    }

    /// Query the sandbox's live package inventory for `names`
    pub async fn check_status(&self, sandbox_id: &str, names: &[String]) -> PackageCheckReport {
        let sandbox = match self.manager.acquire_running(sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!(sandbox = %sandbox_id, "Cannot check packages: {}", e);
                return PackageCheckReport::failed(
                    format!("Failed to check packages: {}", e),
                    e.to_string(),
                );
            }
        };

        let command = &self.manager.config().execution.inventory_command;
        let output = match sandbox.exec(ExecRequest::shell(command)).await {
            Ok(output) => output,
            Err(e) => {
                error!(sandbox_id = %sandbox.sandbox().short_id(), "Inventory exec failed: {}", e);
                return PackageCheckReport::failed("Failed to list installed packages", e.to_string());
            }
        };

        if !output.success() {
            let mut raw = output.stdout_lossy();
            raw.push_str(&output.stderr_lossy());
            return PackageCheckReport::failed("Failed to list installed packages", raw);
        }

        let inventory: Vec<InventoryEntry> = match serde_json::from_slice(&output.stdout) {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!("Unparsable package inventory: {}", e);
                return PackageCheckReport::failed(
                    "Failed to parse installed package list",
                    output.stdout_lossy(),
                );
            }
        };

        let installed: HashMap<String, String> = inventory
            .into_iter()
            .map(|entry| (entry.name.to_lowercase(), entry.version))
            .collect();

        let packages = names
            .iter()
            .map(|name| {
                let version = installed.get(&name.trim().to_lowercase()).cloned();
                (
                    name.clone(),
                    PackagePresence {
                        installed: version.is_some(),
                        version,
                    },
                )
            })
            .collect();

        PackageCheckReport {
            status: InstallState::Success,
            message: "Checked package status".to_string(),
            stderr: None,
            packages,
        }
    }
}
