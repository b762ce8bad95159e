//! Declarative patch documents for group mutations.

use crate::app::AppSpec;
use crate::error::OrchestratorError;
use crate::group::Group;
use crate::path::PathId;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Which of the mutually exclusive alternatives an update selects.
/// Alternatives are checked in this order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateKind {
    /// Replace the subtree with its stored prior version.
    Revert(Timestamp),
    /// Multiply every transitive app's instance count, rounding up.
    Scale(f64),
    /// Merge declared apps and sub-groups into the group.
    Structural,
}

/// A patch describing an intended mutation at a path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupUpdate {
    /// Target id, relative to the path the update is applied at.
    pub id: Option<PathId>,
    pub apps: Option<Vec<AppSpec>>,
    pub groups: Option<Vec<GroupUpdate>>,
    pub dependencies: Option<Vec<PathId>>,
    pub scale_by: Option<f64>,
    pub version: Option<Timestamp>,
}

/// Instance count after scaling by `factor`, rounding up.
pub fn scaled_instances(instances: u32, factor: f64) -> u32 {
    (instances as f64 * factor).ceil().max(0.0) as u32
}

impl GroupUpdate {
    /// Which alternative this update selects.
    pub fn kind(&self) -> UpdateKind {
        if let Some(version) = self.version {
            UpdateKind::Revert(version)
        } else if let Some(factor) = self.scale_by {
            UpdateKind::Scale(factor)
        } else {
            UpdateKind::Structural
        }
    }

    /// Reject updates mixing the mutually exclusive alternatives.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut errors = Vec::new();
        self.validate_into("", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(errors))
        }
    }

    fn is_structural(&self) -> bool {
        self.apps.is_some() || self.groups.is_some() || self.dependencies.is_some()
    }

    fn validate_into(&self, at: &str, errors: &mut Vec<String>) {
        if self.version.is_some() && (self.scale_by.is_some() || self.is_structural()) {
            errors.push(format!("{at}version: must not be combined with other fields"));
        }
        if self.scale_by.is_some() && self.is_structural() {
            errors.push(format!("{at}scaleBy: must not be combined with app or group fields"));
        }
        if let Some(factor) = self.scale_by
            && !(factor.is_finite() && factor >= 0.0)
        {
            errors.push(format!("{at}scaleBy: must be a non-negative number"));
        }
        if let Some(groups) = &self.groups {
            for (idx, nested) in groups.iter().enumerate() {
                let here = match &nested.id {
                    Some(id) => format!("{at}groups/{id}: "),
                    None => {
                        errors.push(format!("{at}groups[{idx}]: nested update requires an id"));
                        continue;
                    }
                };
                if nested.version.is_some() || nested.scale_by.is_some() {
                    errors.push(format!(
                        "{here}nested updates must be structural (no version or scaleBy)"
                    ));
                }
                nested.validate_into(&here, errors);
            }
        }
    }

    /// Merge this (structural) update into `base`, tagging every created
    /// or changed node with `version`. Declared apps replace same-id apps;
    /// declared sub-groups merge recursively, created when absent.
    pub fn apply(&self, base: &Group, version: Timestamp) -> Result<Group, OrchestratorError> {
        let mut next = base.clone();
        next.version = version;
        if let Some(dependencies) = &self.dependencies {
            next.dependencies = dependencies
                .iter()
                .map(|d| d.canonical_path(&base.id.parent()))
                .collect();
        }
        if let Some(apps) = &self.apps {
            for declared in apps {
                let id = declared.id.canonical_path(&base.id);
                if id.parent() != next.id {
                    return Err(OrchestratorError::InvalidHierarchy {
                        parent: next.id.clone(),
                        child: id,
                    });
                }
                if next.groups.contains_key(&id) {
                    return Err(OrchestratorError::ConflictingPath(id));
                }
                let mut spec = declared.clone();
                spec.id = id.clone();
                spec.version = version;
                next.apps.insert(id, spec);
            }
        }
        if let Some(groups) = &self.groups {
            for nested in groups {
                let id = nested
                    .id
                    .as_ref()
                    .ok_or_else(|| {
                        OrchestratorError::invalid("nested group update requires an id")
                    })?
                    .canonical_path(&base.id);
                if id.parent() != next.id {
                    return Err(OrchestratorError::InvalidHierarchy {
                        parent: next.id.clone(),
                        child: id,
                    });
                }
                if next.apps.contains_key(&id) {
                    return Err(OrchestratorError::ConflictingPath(id));
                }
                let child_base = next
                    .groups
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| Group::empty(id.clone(), version));
                let merged = nested.apply(&child_base, version)?;
                next.groups.insert(id, merged);
            }
        }
        Ok(next)
    }
}
