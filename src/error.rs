//! Driver error types.
//!
//! All failures in this crate are represented by the [`CsiError`] enum, which
//! derives [`thiserror::Error`] for ergonomic error handling and implements
//! [`Serialize`]/[`Deserialize`] so errors can travel across the transport
//! layer. The variants mirror the CSI status codes the orchestrator
//! understands; [`CsiError::code`] exposes the mapping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all driver operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// A request field was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced volume, snapshot, pool, project, or target group does
    /// not exist, locally or on the appliance.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create collided with an existing resource that is incompatible with
    /// the request.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation cannot proceed in the resource's current condition
    /// (snapshots still present, dependent clones, foreign initiator group).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Credentials were missing or rejected. Never retried.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// A concurrent conflicting operation holds the resource. The caller may
    /// retry.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A node-side mount was refused by the kernel.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested operation is outside the supported range (block volume
    /// expansion).
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// An internal invariant failed or a collaborator misbehaved.
    #[error("internal error: {0}")]
    Internal(String),

    /// The appliance answered with an unexpected status. Carries the HTTP
    /// status and the appliance fault message; surfaces as `UNKNOWN`.
    #[error("appliance fault (status {status}): {message}")]
    Appliance { status: u16, message: String },
}

impl CsiError {
    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// The CSI status-code name this error maps to.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Aborted(_) => "ABORTED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::OutOfRange(_) => "OUT_OF_RANGE",
            Self::Internal(_) => "INTERNAL",
            Self::Appliance { .. } => "UNKNOWN",
        }
    }

    /// HTTP status reported by the appliance, when this error wraps one.
    pub fn appliance_status(&self) -> Option<u16> {
        match self {
            Self::Appliance { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the error means the resource is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
