// ABOUTME: Docker sandbox orchestration engine for running untrusted code in capped containers
// ABOUTME: Lifecycle management, code execution, file transfer, package installs and periodic tasks

pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod files;
pub mod image;
pub mod manager;
pub mod packages;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use config::{ConfigError, SandboxConfig};
pub use engine::{DockerEngine, Engine, EngineError, ExecOutput, ExecRequest};
pub use error::{Result, SandboxError};
pub use execution::{CodeExecutor, CommandResult, ExecutionResult, FAILURE_EXIT_CODE};
pub use files::{FileDownload, FileRequest, FileTransfer, UploadResult};
pub use manager::{ResetReport, RunningSandbox, SandboxManager};
pub use packages::{PackageCheckReport, PackageInstaller, PackagePresence};
pub use scheduler::{TaskInfo, TaskScheduler};
pub use types::{
    FileEntry, InstallState, PackageInstallStatus, PackageStatusKey, Sandbox, SandboxDescriptor,
    SandboxStatus, SandboxSummary,
};
