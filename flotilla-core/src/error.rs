//! Error kinds shared across the control plane.

use crate::path::PathId;
use crate::timestamp::Timestamp;
use thiserror::Error;
use uuid::Uuid;

/// Failures of the repository collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// Compare-and-swap on the current root failed: another writer
    /// committed since the expected version was read.
    #[error("root version conflict (expected {expected:?})")]
    VersionConflict { expected: Option<Timestamp> },

    /// The backing store cannot be reached. Retryable.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by group mutations, reads, and deployments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The mutated tree violates an invariant. Carries one message per
    /// offending field.
    #[error("object is not valid: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The target path is already occupied by a node of the other kind
    /// (app vs. group).
    #[error("path '{0}' conflicts with an existing node")]
    ConflictingPath(PathId),

    /// A child was inserted under a parent whose id it does not extend.
    #[error("'{child}' is not a child path of '{parent}'")]
    InvalidHierarchy { parent: PathId, child: PathId },

    /// No group exists at the path.
    #[error("unknown group '{0}'")]
    UnknownGroup(PathId),

    /// No snapshot exists for the requested version.
    #[error("unknown version '{version}' of '{id}'")]
    UnknownVersion { id: PathId, version: Timestamp },

    /// A deployment is in flight and `force` was not set.
    #[error("deployment {deployment} is in progress")]
    DeploymentInProgress { deployment: Uuid },

    /// The caller could not be authenticated.
    #[error("authentication failed")]
    Authentication,

    /// The caller is not permitted to perform the action.
    #[error("not authorized to {action} '{resource}'")]
    Authorization { action: String, resource: PathId },

    /// Persistence failed. Retryable.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl OrchestratorError {
    /// Single-field validation failure.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }
}
