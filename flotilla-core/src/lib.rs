//! Shared model and planner for the Flotilla control plane.
//!
//! The crate holds everything both the daemon and its tests agree on: the
//! hierarchical path ids, versioned group snapshots and their pure
//! transformations, the deployment planner, and the traits through which
//! the control plane consults its collaborators (snapshot repository,
//! task-launch facade).

#![forbid(unsafe_code)]

pub mod app;
pub mod error;
pub mod group;
pub mod path;
pub mod plan;
pub mod repository;
pub mod root;
pub mod state;
pub mod timestamp;
pub mod update;

pub use app::{
    AppSpec, BackoffStrategy, Constraint, ConstraintOperator, Container, ContainerParameter,
    HealthCheck, HealthCheckProtocol, PortDefinition, Resources, UpgradeStrategy,
};
pub use error::{OrchestratorError, RepositoryError};
pub use group::Group;
pub use path::{PathId, PathIdError};
pub use plan::{Action, DeploymentPlan, DeploymentStep};
pub use repository::{InMemoryRepository, Repository};
pub use root::RootGroup;
pub use state::{
    KillReason, LaunchError, MockCluster, TaskId, TaskLaunchFacade, TaskState, TaskStatus,
};
pub use timestamp::{Timestamp, TimestampError};
pub use update::{GroupUpdate, UpdateKind, scaled_instances};
