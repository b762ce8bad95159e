//! Deployment planning: diff two root snapshots into ordered steps.
//!
//! A plan's steps are strictly sequential; the actions inside one step
//! share no dependency edge and may execute concurrently.

use crate::app::AppSpec;
use crate::path::PathId;
use crate::root::RootGroup;
use crate::timestamp::Timestamp;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

/// One executable transition for a single app.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Launch a new app to its declared instance count.
    Start { app: AppSpec },
    /// Kill every task of a removed app.
    Stop { id: PathId },
    /// Adjust the instance count of an unchanged definition.
    Scale { app: AppSpec, from: u32, to: u32 },
    /// Rolling upgrade to a changed definition.
    Restart {
        app: AppSpec,
        from_version: Timestamp,
        from_instances: u32,
    },
}

impl Action {
    /// The app this action targets.
    pub fn app_id(&self) -> &PathId {
        match self {
            Action::Start { app } => &app.id,
            Action::Stop { id } => id,
            Action::Scale { app, .. } => &app.id,
            Action::Restart { app, .. } => &app.id,
        }
    }

    /// JSON rendering used by dry-run responses and events.
    pub fn to_json(&self) -> Value {
        match self {
            Action::Start { app } => json!({
                "action": "StartApplication",
                "app": app.id,
            }),
            Action::Stop { id } => json!({
                "action": "StopApplication",
                "app": id,
            }),
            Action::Scale { app, from, to } => json!({
                "action": "ScaleApplication",
                "app": app.id,
                "from": from,
                "to": to,
            }),
            Action::Restart {
                app,
                from_version,
                ..
            } => json!({
                "action": "RestartApplication",
                "app": app.id,
                "fromVersion": from_version,
                "toVersion": app.version,
            }),
        }
    }
}

/// A set of actions with no dependency edges among them.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentStep {
    pub actions: Vec<Action>,
}

impl DeploymentStep {
    pub fn to_json(&self) -> Value {
        json!({ "actions": self.actions.iter().map(Action::to_json).collect::<Vec<_>>() })
    }
}

/// The executable transformation from one committed root to the next.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub id: Uuid,
    /// Version of the target root.
    pub version: Timestamp,
    pub created_at: Timestamp,
    pub original: RootGroup,
    pub target: RootGroup,
    pub steps: Vec<DeploymentStep>,
}

impl DeploymentPlan {
    /// Diff two roots. Executing the returned steps against a cluster
    /// consistent with `original` yields a cluster consistent with
    /// `target`. The step sequence is deterministic: apps are leveled by
    /// their dependency depth and ordered lexically within a step; stops
    /// of removed apps form a final step.
    pub fn diff(original: &RootGroup, target: &RootGroup) -> DeploymentPlan {
        let from_apps = original.transitive_apps_by_id();
        let to_apps = target.transitive_apps_by_id();

        let mut changes: BTreeMap<PathId, Action> = BTreeMap::new();
        for (id, to) in &to_apps {
            match from_apps.get(id) {
                None => {
                    changes.insert(id.clone(), Action::Start { app: to.clone() });
                }
                Some(from) if from.is_upgrade(to) => {
                    changes.insert(
                        id.clone(),
                        Action::Restart {
                            app: to.clone(),
                            from_version: from.version,
                            from_instances: from.instances,
                        },
                    );
                }
                Some(from) if from.instances != to.instances => {
                    changes.insert(
                        id.clone(),
                        Action::Scale {
                            app: to.clone(),
                            from: from.instances,
                            to: to.instances,
                        },
                    );
                }
                Some(_) => {}
            }
        }

        let stops: Vec<Action> = from_apps
            .keys()
            .filter(|id| !to_apps.contains_key(*id))
            .map(|id| Action::Stop { id: id.clone() })
            .collect();

        let edges = dependency_edges(target, &changes);
        let mut ranks: HashMap<PathId, usize> = HashMap::new();
        let mut levels: BTreeMap<usize, Vec<Action>> = BTreeMap::new();
        for (id, action) in &changes {
            let mut visiting = HashSet::new();
            let level = rank(id, &edges, &mut ranks, &mut visiting);
            levels.entry(level).or_default().push(action.clone());
        }

        let mut steps: Vec<DeploymentStep> = levels
            .into_values()
            .map(|actions| DeploymentStep { actions })
            .collect();
        if !stops.is_empty() {
            steps.push(DeploymentStep { actions: stops });
        }

        DeploymentPlan {
            id: Uuid::new_v4(),
            version: target.version(),
            created_at: Timestamp::now(),
            original: original.clone(),
            target: target.clone(),
            steps,
        }
    }

    /// Whether the diff found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Ids of every app the plan touches.
    pub fn affected_ids(&self) -> BTreeSet<PathId> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter().map(|a| a.app_id().clone()))
            .collect()
    }

    /// The step list as JSON, for dry-run responses.
    pub fn steps_json(&self) -> Value {
        Value::Array(self.steps.iter().map(DeploymentStep::to_json).collect())
    }
}

/// Dependency edges among changed apps: `id` waits for each entry in its
/// set. Declared dependencies come from the app itself and from every
/// enclosing group; a dependency naming a group expands to all changed
/// apps beneath it. Dependencies on unaffected apps add no edge: those
/// apps are already converged.
fn dependency_edges(
    target: &RootGroup,
    changes: &BTreeMap<PathId, Action>,
) -> BTreeMap<PathId, BTreeSet<PathId>> {
    let mut edges: BTreeMap<PathId, BTreeSet<PathId>> = BTreeMap::new();
    for (id, action) in changes {
        let app = match action {
            Action::Start { app }
            | Action::Scale { app, .. }
            | Action::Restart { app, .. } => app,
            Action::Stop { .. } => continue,
        };
        let mut declared: Vec<PathId> = app
            .dependencies
            .iter()
            .map(|d| d.canonical_path(&app.id.parent()))
            .collect();
        let mut ancestor = id.parent();
        loop {
            if let Some(group) = target.group(&ancestor) {
                declared.extend(
                    group
                        .dependencies
                        .iter()
                        .map(|d| d.canonical_path(&ancestor.parent())),
                );
            }
            if ancestor.is_root() {
                break;
            }
            ancestor = ancestor.parent();
        }

        let mut waits = BTreeSet::new();
        for dep in declared {
            for other in changes.keys() {
                if other != id && (dep == *other || dep.contains(other)) {
                    waits.insert(other.clone());
                }
            }
        }
        edges.insert(id.clone(), waits);
    }
    edges
}

/// Longest dependency-path depth of `id`. A cycle would make the plan
/// unexecutable; the back edge is dropped with a warning instead.
fn rank(
    id: &PathId,
    edges: &BTreeMap<PathId, BTreeSet<PathId>>,
    ranks: &mut HashMap<PathId, usize>,
    visiting: &mut HashSet<PathId>,
) -> usize {
    if let Some(&cached) = ranks.get(id) {
        return cached;
    }
    if !visiting.insert(id.clone()) {
        warn!(app = %id, "dependency cycle detected, breaking edge");
        return 0;
    }
    let level = edges
        .get(id)
        .map(|waits| {
            waits
                .iter()
                .map(|dep| rank(dep, edges, ranks, visiting) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    visiting.remove(id);
    ranks.insert(id.clone(), level);
    level
}
