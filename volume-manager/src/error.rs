use std::path::PathBuf;

use thiserror::Error;

/// Failure of a volume lifecycle step.
///
/// Every variant names the volume and the step that failed so the allocation
/// runner can report it without extra context.
#[derive(Error, Debug)]
pub enum VolumeError {
    /// A mode outside the known vocabulary reached the node. Never retried.
    #[error("invalid state for volume '{volume_id}': {reason}")]
    InvalidState { volume_id: String, reason: String },

    #[error("{operation} failed for volume '{volume_id}' at {}: {source}", path.display())]
    LocalIo {
        volume_id: String,
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Plugin kept returning a retryable status until the budget ran out.
    #[error(
        "{operation} for volume '{volume_id}' ({usage}) failed after {attempts} attempts: {status}"
    )]
    TransientRemote {
        volume_id: String,
        usage: String,
        operation: &'static str,
        attempts: u32,
        status: tonic::Status,
    },

    #[error("{operation} for volume '{volume_id}' ({usage}) rejected by plugin: {status}")]
    FatalRemote {
        volume_id: String,
        usage: String,
        operation: &'static str,
        status: tonic::Status,
    },

    /// The caller's deadline elapsed before the plugin call completed.
    #[error("{operation} for volume '{volume_id}' ({usage}) exceeded the caller deadline")]
    DeadlineExceeded {
        volume_id: String,
        usage: String,
        operation: &'static str,
    },

    #[error("{operation} for volume '{volume_id}' ({usage}) was cancelled")]
    Cancelled {
        volume_id: String,
        usage: String,
        operation: &'static str,
    },

    #[error("failed to connect to plugin at '{endpoint}': {reason}")]
    PluginConnect { endpoint: String, reason: String },
}

impl VolumeError {
    /// Whether the whole operation is worth retrying by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VolumeError::TransientRemote { .. }
                | VolumeError::DeadlineExceeded { .. }
                | VolumeError::PluginConnect { .. }
        )
    }
}

// io::Error is not Clone; the copy keeps its kind and message.
impl Clone for VolumeError {
    fn clone(&self) -> Self {
        match self {
            VolumeError::InvalidState { volume_id, reason } => VolumeError::InvalidState {
                volume_id: volume_id.clone(),
                reason: reason.clone(),
            },
            VolumeError::LocalIo {
                volume_id,
                operation,
                path,
                source,
            } => VolumeError::LocalIo {
                volume_id: volume_id.clone(),
                operation: *operation,
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            VolumeError::TransientRemote {
                volume_id,
                usage,
                operation,
                attempts,
                status,
            } => VolumeError::TransientRemote {
                volume_id: volume_id.clone(),
                usage: usage.clone(),
                operation: *operation,
                attempts: *attempts,
                status: status.clone(),
            },
            VolumeError::FatalRemote {
                volume_id,
                usage,
                operation,
                status,
            } => VolumeError::FatalRemote {
                volume_id: volume_id.clone(),
                usage: usage.clone(),
                operation: *operation,
                status: status.clone(),
            },
            VolumeError::DeadlineExceeded {
                volume_id,
                usage,
                operation,
            } => VolumeError::DeadlineExceeded {
                volume_id: volume_id.clone(),
                usage: usage.clone(),
                operation: *operation,
            },
            VolumeError::Cancelled {
                volume_id,
                usage,
                operation,
            } => VolumeError::Cancelled {
                volume_id: volume_id.clone(),
                usage: usage.clone(),
                operation: *operation,
            },
            VolumeError::PluginConnect { endpoint, reason } => VolumeError::PluginConnect {
                endpoint: endpoint.clone(),
                reason: reason.clone(),
            },
        }
    }
}

impl From<VolumeError> for tonic::Status {
    fn from(error: VolumeError) -> Self {
        let message = error.to_string();
        match error {
            VolumeError::InvalidState { .. } => tonic::Status::failed_precondition(message),
            VolumeError::LocalIo { .. } => tonic::Status::internal(message),
            VolumeError::TransientRemote { status, .. } | VolumeError::FatalRemote { status, .. } => {
                tonic::Status::new(status.code(), message)
            }
            VolumeError::DeadlineExceeded { .. } => tonic::Status::deadline_exceeded(message),
            VolumeError::Cancelled { .. } => tonic::Status::cancelled(message),
            VolumeError::PluginConnect { .. } => tonic::Status::unavailable(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, VolumeError>;
