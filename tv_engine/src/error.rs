//! Error types for the provisioning engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by pipeline stages and lifecycle operations.
///
/// Expected preconditions (`FileNotFound`, `PermissionDenied`) are kept
/// distinct from unexpected subprocess failures (`CommandFailed`,
/// `RemoteCommandFailed`) so callers can tell a missing artifact from a
/// broken remote channel.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required external tool is missing from the local host
    #[error("required tool is not available: {0}")]
    ToolUnavailable(String),

    /// Privilege or ownership failure
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An expected intermediate artifact is missing
    #[error("expected file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A local external command exited non-zero
    #[error("command `{command}` failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Secure-copy or remote command exited non-zero
    #[error("remote command against {host} failed: {detail}")]
    RemoteCommandFailed { host: String, detail: String },

    /// The persisted registry could not be parsed
    #[error("registry file {} is corrupt: {detail}", .path.display())]
    RegistryCorrupt { path: PathBuf, detail: String },

    /// A tunnel record failed validation
    #[error("invalid tunnel record: {0}")]
    InvalidRecord(String),

    /// A tunnel name is already registered
    #[error("tunnel `{0}` already exists in the registry")]
    DuplicateTunnel(String),

    /// A tunnel name is not present in the registry
    #[error("tunnel `{0}` is not registered")]
    UnknownTunnel(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Classify an I/O error from a filesystem operation on `path`, keeping
    /// the expected-precondition kinds distinct.
    pub fn from_io(err: io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => EngineError::FileNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => {
                EngineError::PermissionDenied(path.display().to_string())
            }
            _ => EngineError::Io(err),
        }
    }
}
