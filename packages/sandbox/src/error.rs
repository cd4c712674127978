// ABOUTME: Error types for sandbox management and file transfer
// ABOUTME: Pure error values; handlers log them where they are caught

use crate::engine::EngineError;
use crate::types::SandboxStatus;
use thiserror::Error;

/// Main error type for lifecycle and file operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Missing or empty required identifier or path
    #[error("Validation error: {0}")]
    Validation(String),

    /// No container matches the id or name
    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Base image is not present on the engine
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Engine could not be reached during startup
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(#[source] EngineError),

    /// Container could not be created or started
    #[error("Failed to create sandbox {name} from image {image}: {source}")]
    CreateFailed {
        name: String,
        image: String,
        #[source]
        source: EngineError,
    },

    /// Start/stop/remove of an existing sandbox failed
    #[error("Failed to {action} sandbox {sandbox}: {source}")]
    Lifecycle {
        sandbox: String,
        action: &'static str,
        #[source]
        source: EngineError,
    },

    /// Start was accepted but the container did not reach the running state
    #[error("Sandbox {sandbox} is {status} after start")]
    NotRunning {
        sandbox: String,
        status: SandboxStatus,
    },

    #[error("Image build failed: {0}")]
    ImageBuild(#[source] EngineError),

    /// Any other engine failure, wrapped with what was being attempted
    #[error("{context}: {source}")]
    Engine {
        context: String,
        #[source]
        source: EngineError,
    },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Cannot read file {path}: {message}")]
    FileAccess { path: String, message: String },

    #[error("Archive for {0} is empty")]
    EmptyArchive(String),

    #[error("Cannot extract {member} from archive for {path}")]
    MemberNotExtractable { path: String, member: String },

    #[error("Malformed archive for {path}: {message}")]
    MalformedArchive { path: String, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub(crate) fn engine(context: impl Into<String>, source: EngineError) -> Self {
        SandboxError::Engine {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SandboxError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for every "does not exist" flavour: sandbox, file or archive member
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SandboxError::SandboxNotFound(_)
                | SandboxError::FileNotFound(_)
                | SandboxError::MemberNotExtractable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
