//! Error types for the daemon core.
//!
//! One enum covers the whole core error surface: registry lookups,
//! collaborator faults, and the handful of conditions the RPC layer maps to
//! specific status codes. Collaborator implementations return these variants
//! too, so a back-end's "instance not found" and the registry's own read the
//! same way to clients.

use skiff_protocol::{Status, StatusCode};
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Host I/O fault (registry writes, image files, seed artifacts).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A named instance, image, or snapshot is not known.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name collides with an existing instance or snapshot.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The instance is in the wrong lifecycle state for the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A blocking step ran out of time (image fetch, guest shell, first
    /// boot).
    #[error("timeout: {0}")]
    Timeout(String),

    /// A supplied argument was malformed.
    #[error("{0}")]
    InvalidArgument(String),

    /// A finite resource ran out.
    #[error("{0}")]
    ResourceExhausted(String),

    /// Feature not supported by the current hypervisor back-end.
    #[error("The {0} feature is not implemented on this back-end")]
    Unsupported(String),

    /// The hypervisor failed to start an instance after it was committed.
    #[error("{message}")]
    Start {
        /// Name of the instance that failed to start.
        name: String,
        message: String,
    },

    /// A snapshot with the requested name already exists.
    #[error("snapshot \"{0}\" already exists")]
    SnapshotNameTaken(String),

    /// The classic mount helper is missing inside the guest.
    #[error("Error enabling mount support in '{instance}'\n\nPlease install sshfs manually inside the instance.")]
    SshfsMissing { instance: String },

    /// The guest has no first-boot configuration agent.
    #[error("cloud-init not found in instance '{0}'; unable to wait for initialization")]
    MissingFirstBootAgent(String),

    /// The settings store does not know the key.
    #[error("unrecognized settings key: '{0}'")]
    UnrecognizedSetting(String),

    /// The settings store rejected the value.
    #[error("invalid setting '{key}={val}': {reason}")]
    InvalidSetting {
        key: String,
        val: String,
        reason: String,
    },

    /// Unexpected fault inside the daemon or a collaborator.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates an invalid-state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Maps this error to the operation status it resolves to.
    ///
    /// Anything without a more specific mapping becomes failed-precondition,
    /// which is also how uncaught collaborator faults surface to clients.
    #[must_use]
    pub fn to_status(&self) -> Status {
        let code = match self {
            Self::InvalidArgument(_)
            | Self::SnapshotNameTaken(_)
            | Self::UnrecognizedSetting(_)
            | Self::InvalidSetting { .. } => StatusCode::InvalidArgument,
            Self::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            Self::Unsupported(_) => StatusCode::Unimplemented,
            Self::Start { .. } => StatusCode::Aborted,
            Self::NotFound(_) => StatusCode::NotFound,
            Self::AlreadyExists(_) => StatusCode::AlreadyExists,
            Self::Internal(_) => StatusCode::Internal,
            _ => StatusCode::FailedPrecondition,
        };
        Status::new(code, self.to_string())
    }

    /// Maps this error to a status, using internal for anything without a
    /// more specific mapping.
    ///
    /// The settings and snapshot operations use this flavor: their unexpected
    /// faults are daemon bugs rather than precondition failures.
    #[must_use]
    pub fn to_status_internal(&self) -> Status {
        let status = self.to_status();
        if status.code == StatusCode::FailedPrecondition
            && !matches!(self, Self::SshfsMissing { .. } | Self::MissingFirstBootAgent(_))
        {
            Status::new(StatusCode::Internal, self.to_string())
        } else {
            status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_not_found() {
        let err = CoreError::not_found("instance \"gone\"");
        let status = err.to_status();
        assert_eq!(status.code, StatusCode::NotFound);
        assert_eq!(status.message, "not found: instance \"gone\"");
    }

    #[test]
    fn test_start_failure_maps_to_aborted() {
        let err = CoreError::Start {
            name: "primary".to_string(),
            message: "qemu exited early".to_string(),
        };
        let status = err.to_status();
        assert_eq!(status.code, StatusCode::Aborted);
        assert_eq!(status.message, "qemu exited early");
    }

    #[test]
    fn test_default_mapping_is_failed_precondition() {
        let err = CoreError::invalid_state("instance \"primary\" is suspending");
        assert_eq!(err.to_status().code, StatusCode::FailedPrecondition);

        let err = CoreError::timeout("ssh not up in \"primary\" after 300s");
        assert_eq!(err.to_status().code, StatusCode::FailedPrecondition);
    }

    #[test]
    fn test_unsupported_maps_to_unimplemented() {
        let err = CoreError::Unsupported("bridging".to_string());
        let status = err.to_status();
        assert_eq!(status.code, StatusCode::Unimplemented);
        assert_eq!(
            status.message,
            "The bridging feature is not implemented on this back-end"
        );
    }

    #[test]
    fn test_internal_flavor_promotes_unmapped_errors() {
        let err = CoreError::timeout("vault stalled mid-fetch");
        assert_eq!(err.to_status_internal().code, StatusCode::Internal);

        let err = CoreError::SnapshotNameTaken("base".to_string());
        assert_eq!(err.to_status_internal().code, StatusCode::InvalidArgument);

        // Guest-side preconditions keep their code under the internal flavor.
        let err = CoreError::MissingFirstBootAgent("primary".to_string());
        assert_eq!(
            err.to_status_internal().code,
            StatusCode::FailedPrecondition
        );
    }
}
