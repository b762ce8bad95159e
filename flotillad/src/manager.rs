//! Single-writer guardian of the committed root.
//!
//! All mutations funnel through [`GroupManager::update_root`], which holds
//! the process-wide mutation lock across read, validate, plan, persist and
//! executor hand-off. Readers never take that lock: they load the last
//! committed root from a shared reference.

use crate::events::{Event, EventBus};
use crate::executor::DeploymentExecutor;
use flotilla_core::{
    AppSpec, DeploymentPlan, Group, GroupUpdate, OrchestratorError, PathId, Repository, RootGroup,
    Timestamp, UpdateKind, scaled_instances,
};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Serializes mutations of the group tree and owns the executor's
/// lifetime.
pub struct GroupManager {
    repo: Arc<dyn Repository>,
    executor: Arc<DeploymentExecutor>,
    events: EventBus,
    current: RwLock<Arc<RootGroup>>,
    write_lock: Mutex<()>,
}

impl GroupManager {
    /// Load the committed root (committing an empty one on first start)
    /// and build the manager. Fails when the repository is unreachable.
    pub async fn load(
        repo: Arc<dyn Repository>,
        executor: Arc<DeploymentExecutor>,
        events: EventBus,
    ) -> Result<Arc<Self>, OrchestratorError> {
        repo.open().await?;
        let root = match repo.current_root().await? {
            Some(root) => root,
            None => {
                let root = RootGroup::empty(Timestamp::now());
                repo.commit_root(None, root.clone(), Vec::new(), None).await?;
                info!("initialized empty root group");
                root
            }
        };
        Ok(Arc::new(Self {
            repo,
            executor,
            events,
            current: RwLock::new(Arc::new(root)),
            write_lock: Mutex::new(()),
        }))
    }

    /// The current committed root, always consistent.
    pub async fn root(&self) -> Arc<RootGroup> {
        self.current.read().await.clone()
    }

    /// A group from the current root.
    pub async fn group(&self, id: &PathId) -> Option<Group> {
        self.root().await.group(id).cloned()
    }

    /// A group as it was in the stored snapshot at `version`.
    pub async fn group_at(
        &self,
        id: &PathId,
        version: Timestamp,
    ) -> Result<Option<Group>, OrchestratorError> {
        let root = self.repo.root_at(version).await?;
        Ok(root.and_then(|r| r.group(id).cloned()))
    }

    /// Versions in which a group existed, ascending.
    pub async fn versions(&self, id: &PathId) -> Result<Vec<Timestamp>, OrchestratorError> {
        Ok(self.repo.versions_of(id).await?)
    }

    /// The single mutation entry point.
    ///
    /// Holds the root-mutation lock over the entire critical section:
    /// read the current root, apply `transform`, validate, plan, handle
    /// an in-flight deployment (fail or force-cancel), persist with CAS,
    /// publish, and hand the plan to the executor. A failure mid-persist
    /// leaves the pre-mutation root authoritative.
    ///
    /// The requested `version` is clamped under the lock to stay strictly
    /// after the committed root's, so snapshot versions never collide
    /// even when the clock stalls within one millisecond; `transform`
    /// receives the effective version.
    pub async fn update_root<F>(
        &self,
        path: &PathId,
        transform: F,
        version: Timestamp,
        force: bool,
        dry_run: bool,
    ) -> Result<DeploymentPlan, OrchestratorError>
    where
        F: FnOnce(&RootGroup, Timestamp) -> Result<RootGroup, OrchestratorError>,
    {
        let _guard = self.write_lock.lock().await;
        let current = self.current.read().await.clone();
        let version = if version > current.version() {
            version
        } else {
            current.version().succ()
        };
        let next = transform(&current, version)?;
        next.validate()?;
        let plan = DeploymentPlan::diff(&current, &next);
        if dry_run {
            debug!(path = %path, "dry run: returning plan without committing");
            return Ok(plan);
        }

        if let Some(in_flight) = self.executor.first_active().await {
            if !force {
                return Err(OrchestratorError::DeploymentInProgress {
                    deployment: in_flight,
                });
            }
            info!(deployment = %in_flight, "force update: canceling in-flight deployment");
            self.executor.cancel_and_wait(in_flight).await;
        }

        let affected: Vec<AppSpec> = plan
            .affected_ids()
            .iter()
            .filter_map(|id| next.app(id).cloned())
            .collect();
        if let Err(err) = self
            .repo
            .commit_root(
                Some(current.version()),
                next.clone(),
                affected,
                Some(plan.clone()),
            )
            .await
        {
            self.events.publish(&Event::GroupChangeFailed {
                group_id: path.clone(),
                reason: err.to_string(),
            });
            return Err(err.into());
        }

        *self.current.write().await = Arc::new(next);
        self.events.publish(&Event::GroupChangeSuccess {
            group_id: path.clone(),
            version,
        });
        self.executor.start(plan.clone()).await;
        Ok(plan)
    }

    /// Apply a [`GroupUpdate`] at `path`. With `create_only`, an existing
    /// node at the path is a conflict (the POST semantics).
    pub async fn apply_update(
        &self,
        path: &PathId,
        update: GroupUpdate,
        force: bool,
        dry_run: bool,
        create_only: bool,
    ) -> Result<DeploymentPlan, OrchestratorError> {
        update.validate()?;
        let requested = Timestamp::now();
        let target = path.clone();

        match update.kind() {
            UpdateKind::Revert(stored_version) => {
                let stored = self
                    .repo
                    .root_at(stored_version)
                    .await?
                    .ok_or(OrchestratorError::UnknownVersion {
                        id: target.clone(),
                        version: stored_version,
                    })?;
                let subtree = stored
                    .group(&target)
                    .cloned()
                    .ok_or(OrchestratorError::UnknownVersion {
                        id: target.clone(),
                        version: stored_version,
                    })?;
                self.update_root(
                    path,
                    move |root, version| {
                        if subtree.id.is_root() {
                            return RootGroup::from_group(Group { version, ..subtree });
                        }
                        root.put_group(subtree, version)
                    },
                    requested,
                    force,
                    dry_run,
                )
                .await
            }
            UpdateKind::Scale(factor) => {
                self.update_root(
                    path,
                    move |root, version| {
                        root.update_transitive_apps(
                            &target,
                            |app| {
                                let instances = scaled_instances(app.instances, factor);
                                app.clone().with_instances(instances).with_version(version)
                            },
                            version,
                        )
                    },
                    requested,
                    force,
                    dry_run,
                )
                .await
            }
            UpdateKind::Structural => {
                self.update_root(
                    path,
                    move |root, version| {
                        let existing = root.group(&target).cloned();
                        if root.app(&target).is_some() {
                            return Err(OrchestratorError::ConflictingPath(target.clone()));
                        }
                        if create_only && existing.is_some() {
                            return Err(OrchestratorError::ConflictingPath(target.clone()));
                        }
                        let base =
                            existing.unwrap_or_else(|| Group::empty(target.clone(), version));
                        let merged = update.apply(&base, version)?;
                        if merged.id.is_root() {
                            return RootGroup::from_group(merged);
                        }
                        root.put_group(merged, version)
                    },
                    requested,
                    force,
                    dry_run,
                )
                .await
            }
        }
    }

    /// Detach a group and stop everything beneath it.
    pub async fn delete_group(
        &self,
        path: &PathId,
        force: bool,
    ) -> Result<DeploymentPlan, OrchestratorError> {
        let target = path.clone();
        self.update_root(
            path,
            move |root, version| root.remove_group(&target, version),
            Timestamp::now(),
            force,
            false,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::health::{HealthRegistry, NetworkProber};
    use flotilla_core::{BackoffStrategy, InMemoryRepository, MockCluster, TaskLaunchFacade};
    use serde_json::json;
    use std::time::Duration;

    fn path(s: &str) -> PathId {
        PathId::parse(s).unwrap()
    }

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        cluster: Arc<MockCluster>,
        executor: Arc<DeploymentExecutor>,
        manager: Arc<GroupManager>,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let cluster = Arc::new(MockCluster::new());
        let bus = EventBus::new(256);
        let registry = Arc::new(HealthRegistry::new(
            cluster.clone() as Arc<dyn TaskLaunchFacade>,
            bus.clone(),
            Arc::new(NetworkProber::new()),
        ));
        let executor = Arc::new(DeploymentExecutor::new(
            cluster.clone() as Arc<dyn TaskLaunchFacade>,
            repo.clone() as Arc<dyn Repository>,
            registry,
            bus.clone(),
            ExecutorConfig {
                poll_interval: Duration::from_millis(10),
            },
        ));
        let manager = GroupManager::load(
            repo.clone() as Arc<dyn Repository>,
            executor.clone(),
            bus,
        )
        .await
        .unwrap();
        Fixture {
            repo,
            cluster,
            executor,
            manager,
        }
    }

    fn create_update(app: &str) -> GroupUpdate {
        serde_json::from_value(json!({ "apps": [{ "id": app, "cmd": "run" }] })).unwrap()
    }

    async fn wait_converged(fx: &Fixture) {
        for _ in 0..500 {
            if fx.executor.first_active().await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment did not converge");
    }

    #[tokio::test]
    async fn structural_update_commits_and_deploys() {
        let fx = fixture().await;
        let plan = fx
            .manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 1);

        let root = fx.manager.root().await;
        assert_eq!(root.app(&path("/a/b")).unwrap().cmd.as_deref(), Some("run"));
        assert_eq!(
            fx.repo.current_root().await.unwrap().unwrap().version(),
            root.version()
        );

        wait_converged(&fx).await;
        let app = root.app(&path("/a/b")).unwrap().clone();
        assert_eq!(fx.cluster.running_count(&app.id, app.version).await, 1);
    }

    #[tokio::test]
    async fn create_only_conflicts_on_existing_path() {
        let fx = fixture().await;
        fx.manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap();
        wait_converged(&fx).await;

        let err = fx
            .manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ConflictingPath(p) if p == path("/a")));
    }

    #[tokio::test]
    async fn dry_run_commits_nothing() {
        let fx = fixture().await;
        let before = fx.manager.root().await.version();
        let plan = fx
            .manager
            .apply_update(&path("/a"), create_update("b"), false, true, false)
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(fx.manager.root().await.version(), before);
        assert!(fx.executor.first_active().await.is_none());
        assert!(fx.cluster.tasks(&path("/a/b")).await.is_empty());
    }

    #[tokio::test]
    async fn scale_update_multiplies_transitive_instances() {
        let fx = fixture().await;
        fx.manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap();
        wait_converged(&fx).await;

        let scale: GroupUpdate = serde_json::from_value(json!({ "scaleBy": 2.5 })).unwrap();
        fx.manager
            .apply_update(&path("/a"), scale, false, false, false)
            .await
            .unwrap();
        assert_eq!(fx.manager.root().await.app(&path("/a/b")).unwrap().instances, 3);
        wait_converged(&fx).await;
    }

    #[tokio::test]
    async fn update_without_force_conflicts_with_in_flight_deployment() {
        let fx = fixture().await;
        // A failing app with a generous backoff budget keeps the first
        // deployment in flight.
        let mut update = create_update("stuck");
        update.apps.as_mut().unwrap()[0].backoff = BackoffStrategy {
            initial_seconds: 0.02,
            factor: 1.0,
            max_seconds: 0.02,
            max_launch_delay_seconds: 60.0,
        };
        fx.cluster.set_failing(path("/a/stuck"), true).await;
        let first = fx
            .manager
            .apply_update(&path("/a"), update, false, false, true)
            .await
            .unwrap();

        let err = fx
            .manager
            .apply_update(&path("/other"), create_update("x"), false, false, true)
            .await
            .unwrap_err();
        assert!(
            matches!(err, OrchestratorError::DeploymentInProgress { deployment } if deployment == first.id)
        );

        // Forcing cancels the stuck deployment and commits.
        fx.manager
            .apply_update(&path("/other"), create_update("x"), true, false, true)
            .await
            .unwrap();
        assert!(fx.manager.root().await.app(&path("/other/x")).is_some());
        wait_converged(&fx).await;
    }

    #[tokio::test]
    async fn failed_persist_leaves_the_old_root_authoritative() {
        let fx = fixture().await;
        fx.manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap();
        wait_converged(&fx).await;
        let before = fx.manager.root().await;

        fx.repo.set_unavailable(true);
        let err = fx
            .manager
            .apply_update(&path("/c"), create_update("d"), false, false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Repository(_)));
        assert_eq!(fx.manager.root().await.version(), before.version());
        fx.repo.set_unavailable(false);
    }

    #[tokio::test]
    async fn concurrent_updates_serialize_and_both_commit() {
        let fx = fixture().await;
        let left = {
            let manager = fx.manager.clone();
            tokio::spawn(async move {
                manager
                    .apply_update(&path("/left"), create_update("a"), true, false, true)
                    .await
            })
        };
        let right = {
            let manager = fx.manager.clone();
            tokio::spawn(async move {
                manager
                    .apply_update(&path("/right"), create_update("b"), true, false, true)
                    .await
            })
        };
        left.await.unwrap().unwrap();
        right.await.unwrap().unwrap();

        let root = fx.manager.root().await;
        assert!(root.app(&path("/left/a")).is_some());
        assert!(root.app(&path("/right/b")).is_some());
        wait_converged(&fx).await;
    }

    #[tokio::test]
    async fn revert_restores_a_stored_version() {
        let fx = fixture().await;
        fx.manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap();
        wait_converged(&fx).await;
        let good_version = fx.manager.root().await.version();

        // Add a second app, then revert the group to the stored version.
        fx.manager
            .apply_update(&path("/a"), create_update("extra"), false, false, false)
            .await
            .unwrap();
        wait_converged(&fx).await;
        assert!(fx.manager.root().await.app(&path("/a/extra")).is_some());

        let revert: GroupUpdate =
            serde_json::from_value(json!({ "version": good_version.to_string() })).unwrap();
        let plan = fx
            .manager
            .apply_update(&path("/a"), revert, false, false, false)
            .await
            .unwrap();
        assert!(!plan.is_empty());
        let root = fx.manager.root().await;
        assert!(root.app(&path("/a/b")).is_some());
        assert!(root.app(&path("/a/extra")).is_none());
        wait_converged(&fx).await;
    }

    #[tokio::test]
    async fn revert_to_unknown_version_is_an_error() {
        let fx = fixture().await;
        let revert: GroupUpdate = serde_json::from_value(
            json!({ "version": Timestamp::from_millis(123).to_string() }),
        )
        .unwrap();
        let err = fx
            .manager
            .apply_update(&path("/a"), revert, false, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownVersion { .. }));
    }

    #[tokio::test]
    async fn delete_group_stops_its_apps() {
        let fx = fixture().await;
        fx.manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap();
        wait_converged(&fx).await;

        let plan = fx.manager.delete_group(&path("/a"), false).await.unwrap();
        assert!(!plan.is_empty());
        assert!(fx.manager.root().await.group(&path("/a")).is_none());
        wait_converged(&fx).await;
        assert!(fx.cluster.tasks(&path("/a/b")).await.is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_group_is_an_error() {
        let fx = fixture().await;
        let err = fx.manager.delete_group(&path("/nope"), false).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn versions_track_snapshot_history() {
        let fx = fixture().await;
        fx.manager
            .apply_update(&path("/a"), create_update("b"), false, false, true)
            .await
            .unwrap();
        wait_converged(&fx).await;
        let v1 = fx.manager.root().await.version();

        fx.manager
            .apply_update(&path("/a"), create_update("c"), false, false, false)
            .await
            .unwrap();
        wait_converged(&fx).await;
        let v2 = fx.manager.root().await.version();

        let versions = fx.manager.versions(&path("/a")).await.unwrap();
        assert_eq!(versions, vec![v1, v2]);

        let old = fx.manager.group_at(&path("/a"), v1).await.unwrap().unwrap();
        assert!(old.apps.contains_key(&path("/a/b")));
        assert!(!old.apps.contains_key(&path("/a/c")));
    }
}
