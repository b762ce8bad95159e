//! Declarative application specifications.
//!
//! An [`AppSpec`] is an immutable description of a long-running workload:
//! any change produces a new value carrying a new version.

use crate::path::PathId;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource requirements for one task of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
        }
    }
}

/// Container parameters passed through to the task runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ContainerParameter>,
}

/// A single key/value runtime parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerParameter {
    pub key: String,
    pub value: String,
}

/// Health probe protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckProtocol {
    Http,
    Tcp,
    Command,
}

/// A periodic health probe attached to an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheck {
    pub protocol: HealthCheckProtocol,
    /// Request path for HTTP probes.
    pub path: Option<String>,
    /// Index into the app's port definitions.
    pub port_index: usize,
    /// Explicit probe port, overriding `port_index`.
    pub port: Option<u16>,
    /// Shell command for COMMAND probes; results arrive from the task
    /// runtime, never from the supervisor's own scheduler.
    pub command: Option<String>,
    pub grace_period_seconds: u64,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    /// Failures tolerated before a kill is requested. Zero disables
    /// kill requests and pins the task alive.
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            protocol: HealthCheckProtocol::Http,
            path: Some("/".to_string()),
            port_index: 0,
            port: None,
            command: None,
            grace_period_seconds: 300,
            interval_seconds: 60,
            timeout_seconds: 20,
            max_consecutive_failures: 3,
        }
    }
}

/// Exponential launch backoff bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffStrategy {
    /// Delay after the first failed launch, in seconds.
    pub initial_seconds: f64,
    /// Multiplier applied per consecutive failure.
    pub factor: f64,
    /// Upper bound on a single delay, in seconds.
    pub max_seconds: f64,
    /// Total delay budget; once exhausted the deployment fails.
    pub max_launch_delay_seconds: f64,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            initial_seconds: 1.0,
            factor: 1.15,
            max_seconds: 60.0,
            max_launch_delay_seconds: 300.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the next launch after `failures` consecutive failures:
    /// `min(initial · factor^k, max)`.
    pub fn delay_seconds(&self, failures: u32) -> f64 {
        (self.initial_seconds * self.factor.powi(failures as i32)).min(self.max_seconds)
    }
}

/// Bounds on capacity during a rolling upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeStrategy {
    /// Fraction of the old instance count that must stay healthy.
    pub minimum_health_capacity: f64,
    /// Extra capacity fraction allowed above the old instance count.
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

/// Placement constraint operator. Placement itself is delegated; the
/// constraint is declarative data carried to the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintOperator {
    Unique,
    Cluster,
    GroupBy,
    Like,
    Unlike,
    MaxPer,
}

/// A placement constraint: `(field, operator, value?)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub field: String,
    pub operator: ConstraintOperator,
    #[serde(default)]
    pub value: Option<String>,
}

/// A named port requested for each task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortDefinition {
    pub port: u16,
    pub name: Option<String>,
    pub protocol: String,
}

impl Default for PortDefinition {
    fn default() -> Self {
        Self {
            port: 0,
            name: None,
            protocol: "tcp".to_string(),
        }
    }
}

fn default_instances() -> u32 {
    1
}

/// Declarative specification of a long-running workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub id: PathId,
    #[serde(default = "Timestamp::zero")]
    pub version: Timestamp,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub container: Option<Container>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheck>,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub port_definitions: Vec<PortDefinition>,
    #[serde(default)]
    pub dependencies: Vec<PathId>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl AppSpec {
    /// Minimal spec with defaults, used pervasively in tests.
    pub fn new(id: PathId) -> Self {
        Self {
            id,
            version: Timestamp::zero(),
            cmd: None,
            resources: Resources::default(),
            instances: 1,
            container: None,
            health_checks: Vec::new(),
            backoff: BackoffStrategy::default(),
            upgrade_strategy: UpgradeStrategy::default(),
            constraints: Vec::new(),
            port_definitions: Vec::new(),
            dependencies: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: Timestamp) -> Self {
        self.version = version;
        self
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = Some(cmd.into());
        self
    }

    /// Whether the two specs describe the same workload ignoring
    /// `instances` and `version`.
    pub fn definition_eq(&self, other: &AppSpec) -> bool {
        self.id == other.id
            && self.cmd == other.cmd
            && self.resources == other.resources
            && self.container == other.container
            && self.health_checks == other.health_checks
            && self.backoff == other.backoff
            && self.upgrade_strategy == other.upgrade_strategy
            && self.constraints == other.constraints
            && self.port_definitions == other.port_definitions
            && self.dependencies == other.dependencies
            && self.env == other.env
            && self.labels == other.labels
    }

    /// A pure scale change: same definition, different instance count.
    pub fn is_scale_only_change(&self, to: &AppSpec) -> bool {
        self.definition_eq(to) && self.instances != to.instances
    }

    /// A configuration change requiring a rolling restart.
    pub fn is_upgrade(&self, to: &AppSpec) -> bool {
        !self.definition_eq(to)
    }

    /// Resolve the probe port for a health check from its explicit port
    /// or the indexed port definition.
    pub fn health_check_port(&self, check: &HealthCheck) -> Option<u16> {
        check
            .port
            .or_else(|| self.port_definitions.get(check.port_index).map(|p| p.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str) -> AppSpec {
        AppSpec::new(PathId::parse(id).unwrap())
    }

    #[test]
    fn deserializes_with_defaults() {
        let spec: AppSpec = serde_json::from_str(r#"{"id": "b", "cmd": "run"}"#).unwrap();
        assert_eq!(spec.id.to_string(), "b");
        assert_eq!(spec.cmd.as_deref(), Some("run"));
        assert_eq!(spec.instances, 1);
        assert_eq!(spec.resources.cpus, 1.0);
        assert!(spec.health_checks.is_empty());
    }

    #[test]
    fn scale_only_change_ignores_version() {
        let from = app("/a/b").with_version(Timestamp::from_millis(1));
        let to = from.clone().with_instances(5).with_version(Timestamp::from_millis(2));
        assert!(from.is_scale_only_change(&to));
        assert!(!from.is_upgrade(&to));
    }

    #[test]
    fn command_change_is_an_upgrade() {
        let from = app("/a/b").with_cmd("run v1");
        let to = from.clone().with_cmd("run v2");
        assert!(from.is_upgrade(&to));
        assert!(!from.is_scale_only_change(&to));
    }

    #[test]
    fn backoff_delay_is_capped() {
        let backoff = BackoffStrategy {
            initial_seconds: 1.0,
            factor: 2.0,
            max_seconds: 5.0,
            max_launch_delay_seconds: 300.0,
        };
        assert_eq!(backoff.delay_seconds(0), 1.0);
        assert_eq!(backoff.delay_seconds(2), 4.0);
        assert_eq!(backoff.delay_seconds(10), 5.0);
    }

    #[test]
    fn health_check_port_prefers_explicit_port() {
        let mut spec = app("/a/b");
        spec.port_definitions = vec![PortDefinition {
            port: 8080,
            ..PortDefinition::default()
        }];
        let indexed = HealthCheck::default();
        assert_eq!(spec.health_check_port(&indexed), Some(8080));

        let explicit = HealthCheck {
            port: Some(9090),
            ..HealthCheck::default()
        };
        assert_eq!(spec.health_check_port(&explicit), Some(9090));
    }

    #[test]
    fn health_check_protocol_uses_wire_names() {
        let json = serde_json::to_string(&HealthCheckProtocol::Command).unwrap();
        assert_eq!(json, "\"COMMAND\"");
    }
}
