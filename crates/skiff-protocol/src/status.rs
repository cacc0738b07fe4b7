//! Operation status codes and the composite status type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Status code resolved by every daemon operation.
///
/// The taxonomy mirrors the usual RPC conventions: a batch operation computes
/// one code for the whole request, with per-target messages concatenated into
/// the status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Operation succeeded.
    Ok,
    /// A supplied argument was malformed (bad name, bad MAC, bad size, ...).
    InvalidArgument,
    /// A named instance does not exist.
    NotFound,
    /// A name collides with an operative, deleted, or preparing instance.
    AlreadyExists,
    /// The operation cannot proceed in the current system state.
    FailedPrecondition,
    /// A finite resource was exhausted (e.g. MAC address generation).
    ResourceExhausted,
    /// The operation was aborted after partial progress.
    Aborted,
    /// An unexpected internal fault.
    Internal,
    /// The feature is not supported by the current hypervisor back-end.
    Unimplemented,
    /// An unclassified error.
    Unknown,
}

impl StatusCode {
    /// Returns true for [`StatusCode::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::FailedPrecondition => "failed precondition",
            Self::ResourceExhausted => "resource exhausted",
            Self::Aborted => "aborted",
            Self::Internal => "internal",
            Self::Unimplemented => "unimplemented",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Validation error codes attached to a rejected create/launch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchError {
    /// Memory below the minimum or unparseable.
    InvalidMemSize,
    /// Disk below the minimum or unparseable.
    InvalidDiskSize,
    /// Requested instance name violates the hostname grammar.
    InvalidHostname,
    /// A requested network id or MAC address is invalid.
    InvalidNetwork,
}

/// Why a start target could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartErrorCause {
    /// The instance is in the deleted table.
    InstanceDeleted,
    /// No instance with that name is known.
    DoesNotExist,
}

/// Structured payload attached to some error statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDetail {
    /// Per-option validation codes from the creation pipeline.
    Launch(Vec<LaunchError>),
    /// Per-instance causes for a rejected batch start.
    Start(BTreeMap<String, StartErrorCause>),
}

/// The final outcome of a daemon operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Status code for the whole operation.
    pub code: StatusCode,
    /// Human-readable message; empty on success.
    #[serde(default)]
    pub message: String,
    /// Structured detail payload, when the code calls for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetail>,
}

impl Status {
    /// A successful status.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
            details: None,
        }
    }

    /// A status with the given code and message.
    #[must_use]
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches a structured detail payload.
    #[must_use]
    pub fn with_details(mut self, details: ErrorDetail) -> Self {
        self.details = Some(details);
        self
    }

    /// Returns true if the operation succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_status() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert!(status.message.is_empty());
    }

    #[test]
    fn test_error_status_display() {
        let status = Status::new(StatusCode::NotFound, "instance \"primary\" does not exist");
        assert!(!status.is_ok());
        assert_eq!(
            status.to_string(),
            "not found: instance \"primary\" does not exist"
        );
    }

    #[test]
    fn test_details_round_trip() {
        let status = Status::new(StatusCode::Aborted, "instance(s) missing").with_details(
            ErrorDetail::Start(BTreeMap::from([(
                "gone".to_string(),
                StartErrorCause::DoesNotExist,
            )])),
        );
        let json = serde_json::to_string(&status).unwrap();
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
