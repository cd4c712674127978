// ABOUTME: Shared data model for sandboxes, package installs and file listings
// ABOUTME: Mirrors container engine state; the engine stays authoritative

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label attached to every container this crate manages
pub const SANDBOX_LABEL: &str = "python-sandbox";

/// Prefix applied to every sandbox container name
pub const SANDBOX_NAME_PREFIX: &str = "python-sandbox-";

/// Live state of a sandbox as reported by the container engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Created,
    Running,
    Paused,
    Exited,
    Removed,
    Dead,
    Unknown,
}

impl SandboxStatus {
    /// Convert an engine state string ("running", "exited", ...) to a status
    pub fn from_engine_state(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "created" => SandboxStatus::Created,
            "running" | "restarting" => SandboxStatus::Running,
            "paused" => SandboxStatus::Paused,
            "exited" => SandboxStatus::Exited,
            "removing" => SandboxStatus::Removed,
            "dead" => SandboxStatus::Dead,
            _ => SandboxStatus::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SandboxStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Created => "created",
            SandboxStatus::Running => "running",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Exited => "exited",
            SandboxStatus::Removed => "removed",
            SandboxStatus::Dead => "dead",
            SandboxStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved sandbox: engine identity plus the registry's last-used timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub name: String,
    pub status: SandboxStatus,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl Sandbox {
    /// First 12 characters of the engine id
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Returned by `create_sandbox`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxDescriptor {
    pub sandbox_id: String,
    pub sandbox_name: String,
    pub status: String,
}

/// One row of `list_sandboxes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSummary {
    pub sandbox_id: String,
    pub sandbox_short_id: String,
    pub name: String,
    pub status: SandboxStatus,
    pub image: String,
    pub created: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub cpu: f64,
}

/// Outcome of a package installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    Success,
    Failed,
}

/// Stored result of one install call, either for a single package or for the
/// whole batch. Only completed installs are ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInstallStatus {
    pub status: InstallState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub complete: bool,
    pub success: bool,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,
}

impl PackageInstallStatus {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            status: InstallState::Success,
            message: message.into(),
            stderr: None,
            complete: true,
            success: true,
            end_time: Utc::now(),
            packages: None,
        }
    }

    pub fn failed(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: InstallState::Failed,
            message: message.into(),
            stderr: Some(stderr.into()),
            complete: true,
            success: false,
            end_time: Utc::now(),
            packages: None,
        }
    }

    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = Some(packages);
        self
    }
}

/// Registry key for package install records
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageStatusKey {
    Package(String),
    Batch,
}

impl PackageStatusKey {
    pub fn package(name: impl Into<String>) -> Self {
        PackageStatusKey::Package(name.into())
    }
}

/// A directory entry with its change time (seconds since the epoch)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub change_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_engine_state() {
        assert_eq!(SandboxStatus::from_engine_state("running"), SandboxStatus::Running);
        assert_eq!(SandboxStatus::from_engine_state("RESTARTING"), SandboxStatus::Running);
        assert_eq!(SandboxStatus::from_engine_state("exited"), SandboxStatus::Exited);
        assert_eq!(SandboxStatus::from_engine_state("removing"), SandboxStatus::Removed);
        assert_eq!(SandboxStatus::from_engine_state("bogus"), SandboxStatus::Unknown);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_install_status_serialization() {
        let status = PackageInstallStatus::failed("boom", "pip said no")
            .with_packages(vec!["a".to_string()]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["complete"], true);
        assert_eq!(json["success"], false);
        assert_eq!(json["stderr"], "pip said no");
        assert_eq!(json["packages"][0], "a");

        let ok = serde_json::to_value(PackageInstallStatus::succeeded("fine")).unwrap();
        assert!(ok.get("stderr").is_none());
        assert!(ok.get("packages").is_none());
    }
}
