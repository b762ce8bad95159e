//! Versioned snapshot repository.
//!
//! The repository stores, keyed by kind, id, and version: root snapshots,
//! app specs, and deployment plans in flight. The current root is tagged
//! separately and advanced with compare-and-swap, which is what makes the
//! single-writer discipline safe against external writers.

use crate::app::AppSpec;
use crate::error::RepositoryError;
use crate::path::PathId;
use crate::plan::DeploymentPlan;
use crate::root::RootGroup;
use crate::timestamp::Timestamp;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistent store for snapshots and in-flight plans. Writes come from a
/// single writer; reads from many.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Connectivity check performed once at startup.
    async fn open(&self) -> Result<(), RepositoryError>;

    /// The tagged current root, if any.
    async fn current_root(&self) -> Result<Option<RootGroup>, RepositoryError>;

    /// Atomically store a root snapshot, the affected app versions and the
    /// in-flight plan, then retag the current root. Fails with
    /// [`RepositoryError::VersionConflict`] when the tagged root's version
    /// is not `expected`; nothing is stored in that case.
    async fn commit_root(
        &self,
        expected: Option<Timestamp>,
        root: RootGroup,
        apps: Vec<AppSpec>,
        plan: Option<DeploymentPlan>,
    ) -> Result<(), RepositoryError>;

    /// Root snapshot at an exact version.
    async fn root_at(&self, version: Timestamp) -> Result<Option<RootGroup>, RepositoryError>;

    /// Versions of the snapshots in which a group existed, ascending.
    async fn versions_of(&self, id: &PathId) -> Result<Vec<Timestamp>, RepositoryError>;

    /// A stored app spec at an exact version.
    async fn app_at(
        &self,
        id: &PathId,
        version: Timestamp,
    ) -> Result<Option<AppSpec>, RepositoryError>;

    /// Drop a finished deployment plan.
    async fn remove_plan(&self, id: Uuid) -> Result<(), RepositoryError>;

    /// Plans still in flight (for recovery inspection).
    async fn plans(&self) -> Result<Vec<DeploymentPlan>, RepositoryError>;
}

#[derive(Default)]
struct Store {
    current: Option<Timestamp>,
    roots: BTreeMap<Timestamp, RootGroup>,
    apps: HashMap<(PathId, Timestamp), AppSpec>,
    plans: HashMap<Uuid, DeploymentPlan>,
}

/// In-memory repository used by tests and local mode. `set_unavailable`
/// simulates an unreachable backing store.
#[derive(Default)]
pub struct InMemoryRepository {
    store: RwLock<Store>,
    unavailable: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the backing store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn open(&self) -> Result<(), RepositoryError> {
        self.check_available()
    }

    async fn current_root(&self) -> Result<Option<RootGroup>, RepositoryError> {
        self.check_available()?;
        let store = self.store.read().await;
        Ok(store
            .current
            .and_then(|version| store.roots.get(&version).cloned()))
    }

    async fn commit_root(
        &self,
        expected: Option<Timestamp>,
        root: RootGroup,
        apps: Vec<AppSpec>,
        plan: Option<DeploymentPlan>,
    ) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut store = self.store.write().await;
        if store.current != expected {
            return Err(RepositoryError::VersionConflict { expected });
        }
        let version = root.version();
        store.roots.insert(version, root);
        for app in apps {
            store.apps.insert((app.id.clone(), app.version), app);
        }
        if let Some(plan) = plan {
            store.plans.insert(plan.id, plan);
        }
        store.current = Some(version);
        Ok(())
    }

    async fn root_at(&self, version: Timestamp) -> Result<Option<RootGroup>, RepositoryError> {
        self.check_available()?;
        Ok(self.store.read().await.roots.get(&version).cloned())
    }

    async fn versions_of(&self, id: &PathId) -> Result<Vec<Timestamp>, RepositoryError> {
        self.check_available()?;
        let store = self.store.read().await;
        Ok(store
            .roots
            .iter()
            .filter(|(_, root)| root.group(id).is_some())
            .map(|(version, _)| *version)
            .collect())
    }

    async fn app_at(
        &self,
        id: &PathId,
        version: Timestamp,
    ) -> Result<Option<AppSpec>, RepositoryError> {
        self.check_available()?;
        Ok(self
            .store
            .read()
            .await
            .apps
            .get(&(id.clone(), version))
            .cloned())
    }

    async fn remove_plan(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.check_available()?;
        self.store.write().await.plans.remove(&id);
        Ok(())
    }

    async fn plans(&self) -> Result<Vec<DeploymentPlan>, RepositoryError> {
        self.check_available()?;
        Ok(self.store.read().await.plans.values().cloned().collect())
    }
}
