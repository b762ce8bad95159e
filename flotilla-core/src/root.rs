//! The distinguished top-level group: the whole declarative state of the
//! cluster.

use crate::app::AppSpec;
use crate::error::OrchestratorError;
use crate::group::Group;
use crate::path::PathId;
use crate::timestamp::Timestamp;
use std::collections::BTreeMap;

/// A [`Group`] whose id is the absolute empty path. Its version is the
/// version of the last structural change anywhere in the tree. All
/// operations are pure: they return a new root and never mutate in place.
#[derive(Debug, Clone, PartialEq)]
pub struct RootGroup {
    group: Group,
}

impl RootGroup {
    /// An empty cluster state.
    pub fn empty(version: Timestamp) -> Self {
        Self {
            group: Group::empty(PathId::root(), version),
        }
    }

    /// Wrap an existing tree; the node's id must be the root path.
    pub fn from_group(group: Group) -> Result<Self, OrchestratorError> {
        if !group.id.is_root() {
            return Err(OrchestratorError::invalid(format!(
                "root group must have the root id, got '{}'",
                group.id
            )));
        }
        Ok(Self { group })
    }

    /// Version of the last structural change.
    pub fn version(&self) -> Timestamp {
        self.group.version
    }

    /// The underlying tree.
    pub fn as_group(&self) -> &Group {
        &self.group
    }

    /// Lookup anywhere in the tree.
    pub fn group(&self, id: &PathId) -> Option<&Group> {
        self.group.find_group(id)
    }

    /// Lookup an app anywhere in the tree.
    pub fn app(&self, id: &PathId) -> Option<&AppSpec> {
        self.group.find_app(id)
    }

    /// Flattened app map over the whole tree, keyed and ordered by id.
    pub fn transitive_apps_by_id(&self) -> BTreeMap<PathId, AppSpec> {
        self.group
            .transitive_apps()
            .into_iter()
            .map(|a| (a.id.clone(), a.clone()))
            .collect()
    }

    /// Insert or replace a group, auto-creating missing ancestors.
    pub fn put_group(
        &self,
        target: Group,
        version: Timestamp,
    ) -> Result<RootGroup, OrchestratorError> {
        Ok(Self {
            group: self.group.put_group(target, version)?,
        })
    }

    /// Insert or replace an app, auto-creating missing ancestor groups.
    pub fn put_app(&self, app: AppSpec, version: Timestamp) -> Result<RootGroup, OrchestratorError> {
        Ok(Self {
            group: self.group.put_app(app, version)?,
        })
    }

    /// Detach the subtree at `id`. Removing the root empties the cluster.
    pub fn remove_group(
        &self,
        id: &PathId,
        version: Timestamp,
    ) -> Result<RootGroup, OrchestratorError> {
        if id.is_root() {
            return Ok(RootGroup::empty(version));
        }
        if self.group(id).is_none() {
            return Err(OrchestratorError::UnknownGroup(id.clone()));
        }
        Ok(Self {
            group: self.group.remove_group(id, version),
        })
    }

    /// Map `f` over every app under `id`.
    pub fn update_transitive_apps<F>(
        &self,
        id: &PathId,
        f: F,
        version: Timestamp,
    ) -> Result<RootGroup, OrchestratorError>
    where
        F: Fn(&AppSpec) -> AppSpec,
    {
        let subtree = self
            .group(id)
            .ok_or_else(|| OrchestratorError::UnknownGroup(id.clone()))?;
        let updated = subtree.update_transitive_apps(&f, version);
        if id.is_root() {
            return RootGroup::from_group(updated);
        }
        self.put_group(updated, version)
    }

    /// Check the tree invariants, surfacing every violation at once.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut errors = Vec::new();
        if !self.group.id.is_root() {
            errors.push(format!("root id must be '/', got '{}'", self.group.id));
        }
        self.group.validate_into(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(errors))
        }
    }

    /// Structural equality ignoring group version tags. Used to state
    /// properties like "re-inserting an existing subtree changes nothing
    /// but ancestor versions".
    pub fn eq_ignoring_versions(&self, other: &RootGroup) -> bool {
        self.group.eq_ignoring_versions(&other.group)
    }
}
