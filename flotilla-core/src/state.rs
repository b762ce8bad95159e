//! Running-task model and the task-launch facade.
//!
//! Placement and the wire protocol to the cluster master are delegated:
//! the control plane only talks to a [`TaskLaunchFacade`]. The in-memory
//! [`MockCluster`] implements the facade for tests and for local runs
//! where no real cluster is available.

use crate::app::AppSpec;
use crate::path::PathId;
use crate::timestamp::Timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Opaque identifier of one running instance of an app.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Fresh id for a task of `app_id`.
    pub fn generate(app_id: &PathId) -> Self {
        let flat = app_id.segments().join("_");
        Self(format!("{flat}.{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Staging,
    Running,
    Failed,
    Killed,
}

/// Observed status of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: TaskId,
    pub app_id: PathId,
    /// App version the task was launched from.
    pub version: Timestamp,
    pub state: TaskState,
    pub started_at: Timestamp,
    /// Unreachable tasks may be alive behind a partition; they are never
    /// killed on health grounds.
    pub reachable: bool,
    pub host: String,
    pub ports: Vec<u16>,
}

/// Why a kill was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    FailedHealthChecks,
    Scaling,
    Upgrade,
    Removed,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailedHealthChecks => write!(f, "failed_health_checks"),
            Self::Scaling => write!(f, "scaling"),
            Self::Upgrade => write!(f, "upgrade"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Errors from the launch facade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The cluster declined or lost the launch; the instance never
    /// reached RUNNING.
    #[error("launch of '{app}' rejected: {reason}")]
    Rejected { app: PathId, reason: String },
}

/// Facade over the cluster-resource matcher that physically launches and
/// kills task instances. Kill is idempotent per `(task, reason)`.
#[async_trait]
pub trait TaskLaunchFacade: Send + Sync {
    /// Launch one instance of `app`.
    async fn launch(&self, app: &AppSpec) -> Result<TaskStatus, LaunchError>;

    /// Request a kill. Unknown tasks are ignored so retries are safe.
    async fn kill(&self, task: &TaskId, reason: KillReason);

    /// Live (staging or running) tasks of an app, across versions.
    async fn tasks(&self, app_id: &PathId) -> Vec<TaskStatus>;
}

/// In-memory cluster for tests and local mode: launches succeed
/// immediately unless failure injection is armed for the app.
#[derive(Default)]
pub struct MockCluster {
    tasks: RwLock<HashMap<TaskId, TaskStatus>>,
    failing: RwLock<HashSet<PathId>>,
    kills: RwLock<Vec<(TaskId, KillReason)>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm or disarm launch failures for an app.
    pub async fn set_failing(&self, app_id: PathId, failing: bool) {
        let mut set = self.failing.write().await;
        if failing {
            set.insert(app_id);
        } else {
            set.remove(&app_id);
        }
    }

    /// Mark a task unreachable (simulated network partition).
    pub async fn set_unreachable(&self, task: &TaskId) {
        if let Some(status) = self.tasks.write().await.get_mut(task) {
            status.reachable = false;
        }
    }

    /// Kills observed so far, in request order.
    pub async fn kill_log(&self) -> Vec<(TaskId, KillReason)> {
        self.kills.read().await.clone()
    }

    /// Running tasks of an app at a specific version.
    pub async fn running_count(&self, app_id: &PathId, version: Timestamp) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| {
                t.app_id == *app_id && t.version == version && t.state == TaskState::Running
            })
            .count()
    }
}

#[async_trait]
impl TaskLaunchFacade for MockCluster {
    async fn launch(&self, app: &AppSpec) -> Result<TaskStatus, LaunchError> {
        if self.failing.read().await.contains(&app.id) {
            return Err(LaunchError::Rejected {
                app: app.id.clone(),
                reason: "injected launch failure".to_string(),
            });
        }
        let status = TaskStatus {
            id: TaskId::generate(&app.id),
            app_id: app.id.clone(),
            version: app.version,
            state: TaskState::Running,
            started_at: Timestamp::now(),
            reachable: true,
            host: "localhost".to_string(),
            ports: app.port_definitions.iter().map(|p| p.port).collect(),
        };
        self.tasks
            .write()
            .await
            .insert(status.id.clone(), status.clone());
        Ok(status)
    }

    async fn kill(&self, task: &TaskId, reason: KillReason) {
        let removed = self.tasks.write().await.remove(task);
        if removed.is_some() {
            self.kills.write().await.push((task.clone(), reason));
        }
    }

    async fn tasks(&self, app_id: &PathId) -> Vec<TaskStatus> {
        let mut out: Vec<TaskStatus> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.app_id == *app_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str) -> AppSpec {
        AppSpec::new(PathId::parse(id).unwrap()).with_version(Timestamp::from_millis(1))
    }

    #[tokio::test]
    async fn launch_registers_a_running_task() {
        let cluster = MockCluster::new();
        let spec = app("/a/b");
        let status = cluster.launch(&spec).await.unwrap();
        assert_eq!(status.state, TaskState::Running);
        assert_eq!(cluster.tasks(&spec.id).await.len(), 1);
        assert_eq!(cluster.running_count(&spec.id, spec.version).await, 1);
    }

    #[tokio::test]
    async fn injected_failures_reject_launches() {
        let cluster = MockCluster::new();
        let spec = app("/a/b");
        cluster.set_failing(spec.id.clone(), true).await;
        assert!(cluster.launch(&spec).await.is_err());
        cluster.set_failing(spec.id.clone(), false).await;
        assert!(cluster.launch(&spec).await.is_ok());
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let cluster = MockCluster::new();
        let status = cluster.launch(&app("/a/b")).await.unwrap();
        cluster.kill(&status.id, KillReason::Scaling).await;
        cluster.kill(&status.id, KillReason::Scaling).await;
        assert_eq!(cluster.kill_log().await.len(), 1);
        assert!(cluster.tasks(&status.app_id).await.is_empty());
    }

    #[test]
    fn task_ids_embed_the_app_path() {
        let id = TaskId::generate(&PathId::parse("/prod/web").unwrap());
        assert!(id.as_str().starts_with("prod_web."));
    }
}
