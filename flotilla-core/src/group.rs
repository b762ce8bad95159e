//! Versioned group tree nodes and their pure transformations.
//!
//! Groups are immutable values: every transformation path-copies the spine
//! from the mutated node up to the receiver and returns a new tree. The
//! persistent maps make those copies cheap via structural sharing.

use crate::app::AppSpec;
use crate::error::OrchestratorError;
use crate::path::PathId;
use crate::timestamp::Timestamp;
use im::OrdMap;

/// A named folder in the path tree containing apps and/or sub-groups.
///
/// Invariants (enforced by [`Group::validate_into`]):
/// - every map key equals the entry's own id;
/// - every entry's id is a direct child path of this group's id;
/// - no path names both an app and a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: PathId,
    pub version: Timestamp,
    pub apps: OrdMap<PathId, AppSpec>,
    pub groups: OrdMap<PathId, Group>,
    pub dependencies: Vec<PathId>,
}

impl Group {
    /// A group with no content.
    pub fn empty(id: PathId, version: Timestamp) -> Self {
        Self {
            id,
            version,
            apps: OrdMap::new(),
            groups: OrdMap::new(),
            dependencies: Vec::new(),
        }
    }

    /// Whether the group carries no apps and no sub-groups.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.groups.is_empty()
    }

    /// Find a group anywhere under (or at) this node.
    pub fn find_group(&self, id: &PathId) -> Option<&Group> {
        if &self.id == id {
            return Some(self);
        }
        if !self.id.contains(id) {
            return None;
        }
        let child_id = id.prefix(self.id.len() + 1);
        self.groups.get(&child_id).and_then(|g| g.find_group(id))
    }

    /// Find an app anywhere under this node.
    pub fn find_app(&self, id: &PathId) -> Option<&AppSpec> {
        self.find_group(&id.parent()).and_then(|g| g.apps.get(id))
    }

    /// All apps in the subtree, in lexical id order.
    pub fn transitive_apps(&self) -> Vec<&AppSpec> {
        let mut out: Vec<&AppSpec> = Vec::new();
        self.collect_apps(&mut out);
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn collect_apps<'a>(&'a self, out: &mut Vec<&'a AppSpec>) {
        out.extend(self.apps.values());
        for group in self.groups.values() {
            group.collect_apps(out);
        }
    }

    /// All groups in the subtree including this node.
    pub fn transitive_groups(&self) -> Vec<&Group> {
        let mut out = vec![self];
        for group in self.groups.values() {
            out.extend(group.transitive_groups());
        }
        out
    }

    /// Insert or replace `target` in the subtree, creating missing
    /// ancestors as empty groups. The inserted node is taken as-is; every
    /// ancestor on the spine gets `version`.
    pub fn put_group(
        &self,
        target: Group,
        version: Timestamp,
    ) -> Result<Group, OrchestratorError> {
        if target.id == self.id {
            return Ok(target);
        }
        if !self.id.contains(&target.id) {
            return Err(OrchestratorError::InvalidHierarchy {
                parent: self.id.clone(),
                child: target.id,
            });
        }
        let child_id = target.id.prefix(self.id.len() + 1);
        if self.apps.contains_key(&child_id) {
            return Err(OrchestratorError::ConflictingPath(child_id));
        }
        let child = self
            .groups
            .get(&child_id)
            .cloned()
            .unwrap_or_else(|| Group::empty(child_id.clone(), version));
        let child = child.put_group(target, version)?;
        let mut next = self.clone();
        next.groups.insert(child_id, child);
        next.version = version;
        Ok(next)
    }

    /// Insert or replace an app, creating missing ancestor groups.
    pub fn put_app(&self, app: AppSpec, version: Timestamp) -> Result<Group, OrchestratorError> {
        if app.id == self.id || !self.id.contains(&app.id) {
            return Err(OrchestratorError::InvalidHierarchy {
                parent: self.id.clone(),
                child: app.id,
            });
        }
        let child_id = app.id.prefix(self.id.len() + 1);
        let mut next = self.clone();
        next.version = version;
        if child_id == app.id {
            if self.groups.contains_key(&app.id) {
                return Err(OrchestratorError::ConflictingPath(app.id));
            }
            next.apps.insert(app.id.clone(), app);
        } else {
            if self.apps.contains_key(&child_id) {
                return Err(OrchestratorError::ConflictingPath(child_id));
            }
            let child = self
                .groups
                .get(&child_id)
                .cloned()
                .unwrap_or_else(|| Group::empty(child_id.clone(), version));
            let child = child.put_app(app, version)?;
            next.groups.insert(child_id, child);
        }
        Ok(next)
    }

    /// Detach the subtree at `id`, pruning ancestors left empty by the
    /// removal. A no-op (except for the version bump) when `id` is absent.
    pub fn remove_group(&self, id: &PathId, version: Timestamp) -> Group {
        let mut next = self.clone();
        next.version = version;
        if !self.id.contains(id) || id == &self.id {
            return next;
        }
        let child_id = id.prefix(self.id.len() + 1);
        if child_id == *id {
            next.groups.remove(id);
        } else if let Some(child) = self.groups.get(&child_id) {
            let child = child.remove_group(id, version);
            if child.is_empty() {
                next.groups.remove(&child_id);
            } else {
                next.groups.insert(child_id, child);
            }
        }
        next
    }

    /// Apply `f` to every app in the subtree; every group in the subtree
    /// gets `version`.
    pub fn update_transitive_apps<F>(&self, f: &F, version: Timestamp) -> Group
    where
        F: Fn(&AppSpec) -> AppSpec,
    {
        let mut next = self.clone();
        next.version = version;
        next.apps = self
            .apps
            .iter()
            .map(|(k, app)| (k.clone(), f(app)))
            .collect();
        next.groups = self
            .groups
            .iter()
            .map(|(k, g)| (k.clone(), g.update_transitive_apps(f, version)))
            .collect();
        next
    }

    /// Collect invariant violations for this subtree into `errors`.
    pub fn validate_into(&self, errors: &mut Vec<String>) {
        for (key, app) in self.apps.iter() {
            if key != &app.id {
                errors.push(format!("app key '{key}' does not match id '{}'", app.id));
            }
            if app.id.parent() != self.id {
                errors.push(format!(
                    "app '{}' is not a direct child of group '{}'",
                    app.id, self.id
                ));
            }
            if self.groups.contains_key(key) {
                errors.push(format!("path '{key}' names both an app and a group"));
            }
        }
        for (key, group) in self.groups.iter() {
            if key != &group.id {
                errors.push(format!(
                    "group key '{key}' does not match id '{}'",
                    group.id
                ));
            }
            if group.id.parent() != self.id {
                errors.push(format!(
                    "group '{}' is not a direct child of group '{}'",
                    group.id, self.id
                ));
            }
            group.validate_into(errors);
        }
    }

    /// Structural equality ignoring group version tags.
    pub fn eq_ignoring_versions(&self, other: &Group) -> bool {
        if self.id != other.id
            || self.dependencies != other.dependencies
            || self.apps != other.apps
            || self.groups.len() != other.groups.len()
        {
            return false;
        }
        self.groups
            .iter()
            .zip(other.groups.iter())
            .all(|((ka, ga), (kb, gb))| ka == kb && ga.eq_ignoring_versions(gb))
    }
}
