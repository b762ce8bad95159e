//! Per-workload health supervision.
//!
//! One supervisor actor exists per (app id, app version, check). Each
//! actor owns its probe schedule and health map; nothing is shared
//! mutably. On every tick it purges records for tasks that left the
//! running set, dispatches one probe worker per running task, and
//! reschedules itself. COMMAND-protocol checks are never scheduled here;
//! their results arrive from the task runtime through
//! [`HealthRegistry::deliver`].

use crate::events::{Event, EventBus};
use async_trait::async_trait;
use flotilla_core::{
    AppSpec, HealthCheck, HealthCheckProtocol, KillReason, PathId, TaskId, TaskLaunchFacade,
    TaskState, TaskStatus, Timestamp,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, warn};

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy { cause: String },
}

/// Probes a running task once. Implementations must respect the
/// per-check timeout budget.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, task: &TaskStatus, app: &AppSpec, check: &HealthCheck) -> ProbeOutcome;
}

/// HTTP and TCP prober used in production. The probe timeout is
/// `min(timeoutSeconds, interval - 1s)` so a slow probe can never overlap
/// the next period.
pub struct NetworkProber {
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn budget(check: &HealthCheck) -> Duration {
        let capped = check
            .timeout_seconds
            .min(check.interval_seconds.saturating_sub(1))
            .max(1);
        Duration::from_secs(capped)
    }
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, task: &TaskStatus, app: &AppSpec, check: &HealthCheck) -> ProbeOutcome {
        let Some(port) = app.health_check_port(check) else {
            return ProbeOutcome::Unhealthy {
                cause: "no port available for health check".to_string(),
            };
        };
        let budget = Self::budget(check);
        match check.protocol {
            HealthCheckProtocol::Http => {
                let path = check.path.as_deref().unwrap_or("/");
                let url = format!("http://{}:{}{}", task.host, port, path);
                match tokio::time::timeout(budget, self.client.get(&url).send()).await {
                    Ok(Ok(response)) => {
                        let status = response.status();
                        if status.is_success() || status.is_redirection() {
                            ProbeOutcome::Healthy
                        } else {
                            ProbeOutcome::Unhealthy {
                                cause: format!("HTTP {status} from {url}"),
                            }
                        }
                    }
                    Ok(Err(err)) => ProbeOutcome::Unhealthy {
                        cause: format!("request to {url} failed: {err}"),
                    },
                    Err(_) => ProbeOutcome::Unhealthy {
                        cause: format!("probe of {url} timed out"),
                    },
                }
            }
            HealthCheckProtocol::Tcp => {
                let addr = format!("{}:{}", task.host, port);
                match tokio::time::timeout(budget, TcpStream::connect(&addr)).await {
                    Ok(Ok(_)) => ProbeOutcome::Healthy,
                    Ok(Err(err)) => ProbeOutcome::Unhealthy {
                        cause: format!("connect to {addr} failed: {err}"),
                    },
                    Err(_) => ProbeOutcome::Unhealthy {
                        cause: format!("connect to {addr} timed out"),
                    },
                }
            }
            // Delivered asynchronously by the task runtime.
            HealthCheckProtocol::Command => ProbeOutcome::Unhealthy {
                cause: "command checks are not probed by the supervisor".to_string(),
            },
        }
    }
}

/// The supervisor's judgment about one task, derived from probe history.
///
/// Invariant: `alive ⇔ consecutive_failures < max_consecutive_failures`,
/// with a zero maximum pinning `alive` to true.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub task_id: TaskId,
    pub consecutive_failures: u32,
    pub first_success: Option<Timestamp>,
    pub last_success: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
    pub last_failure_cause: Option<String>,
    pub alive: bool,
}

impl Health {
    /// The zero record: no history, alive.
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            consecutive_failures: 0,
            first_success: None,
            last_success: None,
            last_failure: None,
            last_failure_cause: None,
            alive: true,
        }
    }
}

/// Identity of one supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SupervisorKey {
    pub app_id: PathId,
    pub version: Timestamp,
    pub check_index: usize,
}

enum SupervisorMsg {
    Tick,
    Result {
        task_id: TaskId,
        version: Timestamp,
        outcome: ProbeOutcome,
    },
    GetTaskHealth {
        task_id: TaskId,
        reply: oneshot::Sender<Health>,
    },
    GetAppHealth {
        reply: oneshot::Sender<Vec<Health>>,
    },
    Stop,
}

/// Mailbox handle to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    key: SupervisorKey,
    tx: mpsc::Sender<SupervisorMsg>,
}

impl SupervisorHandle {
    /// Force an immediate probe cycle.
    #[allow(dead_code)] // Driven by tests and the runtime transport
    pub async fn tick(&self) {
        let _ = self.tx.send(SupervisorMsg::Tick).await;
    }

    /// Feed a probe result (COMMAND checks, tests).
    pub async fn deliver(&self, task_id: TaskId, version: Timestamp, outcome: ProbeOutcome) {
        let _ = self
            .tx
            .send(SupervisorMsg::Result {
                task_id,
                version,
                outcome,
            })
            .await;
    }

    /// Health of one task; the zero record when unknown.
    #[allow(dead_code)] // Will be used by the task detail API
    pub async fn task_health(&self, task_id: TaskId) -> Health {
        let (reply, rx) = oneshot::channel();
        let fallback = Health::new(task_id.clone());
        if self
            .tx
            .send(SupervisorMsg::GetTaskHealth { task_id, reply })
            .await
            .is_err()
        {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    /// Health of every tracked task.
    pub async fn app_health(&self) -> Vec<Health> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorMsg::GetAppHealth { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(SupervisorMsg::Stop).await;
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Supervisor {
    key: SupervisorKey,
    app: AppSpec,
    check: HealthCheck,
    facade: Arc<dyn TaskLaunchFacade>,
    events: EventBus,
    prober: Arc<dyn Prober>,
    self_tx: mpsc::Sender<SupervisorMsg>,
    health: HashMap<TaskId, Health>,
    /// Running-set snapshot from the last tick.
    tasks: HashMap<TaskId, TaskStatus>,
    seen_tasks: bool,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::Receiver<SupervisorMsg>) {
        let interval = Duration::from_secs(self.check.interval_seconds.max(1));
        let mut next_tick = tokio::time::Instant::now() + interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {
                    if self.on_tick().await {
                        break;
                    }
                    next_tick = tokio::time::Instant::now() + interval;
                }
                msg = rx.recv() => match msg {
                    Some(SupervisorMsg::Tick) => {
                        if self.on_tick().await {
                            break;
                        }
                        next_tick = tokio::time::Instant::now() + interval;
                    }
                    Some(SupervisorMsg::Result { task_id, version, outcome }) => {
                        self.fold(task_id, version, outcome).await;
                    }
                    Some(SupervisorMsg::GetTaskHealth { task_id, reply }) => {
                        let health = self
                            .health
                            .get(&task_id)
                            .cloned()
                            .unwrap_or_else(|| Health::new(task_id));
                        let _ = reply.send(health);
                    }
                    Some(SupervisorMsg::GetAppHealth { reply }) => {
                        let _ = reply.send(self.health.values().cloned().collect());
                    }
                    Some(SupervisorMsg::Stop) | None => break,
                }
            }
        }
        debug!(app = %self.key.app_id, version = %self.key.version, "health supervisor stopped");
    }

    /// One probe cycle. Returns true when the supervised workload version
    /// has no running tasks left and the supervisor should retire.
    async fn on_tick(&mut self) -> bool {
        let running: HashMap<TaskId, TaskStatus> = self
            .facade
            .tasks(&self.key.app_id)
            .await
            .into_iter()
            .filter(|t| t.version == self.key.version && t.state == TaskState::Running)
            .map(|t| (t.id.clone(), t))
            .collect();

        // Purge records of tasks that left the running set.
        self.health.retain(|id, _| running.contains_key(id));
        self.tasks = running;

        if self.tasks.is_empty() {
            return self.seen_tasks;
        }
        self.seen_tasks = true;

        for (task_id, status) in &self.tasks {
            self.health
                .entry(task_id.clone())
                .or_insert_with(|| Health::new(task_id.clone()));
            if self.check.protocol == HealthCheckProtocol::Command {
                continue;
            }
            let prober = Arc::clone(&self.prober);
            let tx = self.self_tx.clone();
            let status = status.clone();
            let app = self.app.clone();
            let check = self.check.clone();
            let version = self.key.version;
            tokio::spawn(async move {
                let outcome = prober.probe(&status, &app, &check).await;
                let _ = tx
                    .send(SupervisorMsg::Result {
                        task_id: status.id.clone(),
                        version,
                        outcome,
                    })
                    .await;
            });
        }
        false
    }

    async fn fold(&mut self, task_id: TaskId, version: Timestamp, outcome: ProbeOutcome) {
        // Results for another app version are dropped.
        if version != self.key.version {
            return;
        }
        // Results for purged or never-seen tasks are dropped too: they
        // must not count toward consecutive failures.
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let (started_at, reachable) = (task.started_at, task.reachable);
        let Some(health) = self.health.get_mut(&task_id) else {
            return;
        };
        let now = Timestamp::now();
        let was_alive = health.alive;

        match outcome {
            ProbeOutcome::Healthy => {
                if health.first_success.is_none() {
                    health.first_success = Some(now);
                }
                health.last_success = Some(now);
                health.consecutive_failures = 0;
                health.alive = true;
            }
            ProbeOutcome::Unhealthy { cause } => {
                let grace_end = Timestamp::from_millis(
                    started_at.millis() + (self.check.grace_period_seconds as i64) * 1_000,
                );
                if health.first_success.is_none() && now < grace_end {
                    // Grace suppresses pre-first-success failures.
                    return;
                }
                health.consecutive_failures += 1;
                health.last_failure = Some(now);
                health.last_failure_cause = Some(cause.clone());
                self.events.publish(&Event::FailedHealthCheck {
                    app_id: self.key.app_id.clone(),
                    task_id: task_id.clone(),
                    version,
                    cause,
                });
                let max = self.check.max_consecutive_failures;
                health.alive = max == 0 || health.consecutive_failures < max;
                if max > 0 && health.consecutive_failures >= max {
                    if reachable {
                        self.events.publish(&Event::UnhealthyTaskKillEvent {
                            app_id: self.key.app_id.clone(),
                            task_id: task_id.clone(),
                            version,
                            reason: KillReason::FailedHealthChecks.to_string(),
                        });
                        self.facade
                            .kill(&task_id, KillReason::FailedHealthChecks)
                            .await;
                    } else {
                        // A network partition must not cause mass
                        // termination.
                        warn!(task = %task_id, "unhealthy task is unreachable, suppressing kill");
                    }
                }
            }
        }

        let alive = self.health.get(&task_id).map(|h| h.alive).unwrap_or(true);
        if alive != was_alive {
            self.events.publish(&Event::HealthStatusChanged {
                app_id: self.key.app_id.clone(),
                task_id,
                version,
                alive,
            });
        }
    }
}

/// Owns the supervisor actors: one per (app id, app version, check).
/// Supervisors are created when the executor first launches a workload
/// version and retire themselves once no running task of that version
/// remains.
pub struct HealthRegistry {
    facade: Arc<dyn TaskLaunchFacade>,
    events: EventBus,
    prober: Arc<dyn Prober>,
    supervisors: RwLock<HashMap<SupervisorKey, SupervisorHandle>>,
}

impl HealthRegistry {
    pub fn new(facade: Arc<dyn TaskLaunchFacade>, events: EventBus, prober: Arc<dyn Prober>) -> Self {
        Self {
            facade,
            events,
            prober,
            supervisors: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure a supervisor exists for every check of this app version.
    pub async fn watch(&self, app: &AppSpec) {
        let mut supervisors = self.supervisors.write().await;
        supervisors.retain(|_, handle| !handle.is_closed());
        for (check_index, check) in app.health_checks.iter().enumerate() {
            let key = SupervisorKey {
                app_id: app.id.clone(),
                version: app.version,
                check_index,
            };
            if supervisors.contains_key(&key) {
                continue;
            }
            let (tx, rx) = mpsc::channel(64);
            let supervisor = Supervisor {
                key: key.clone(),
                app: app.clone(),
                check: check.clone(),
                facade: Arc::clone(&self.facade),
                events: self.events.clone(),
                prober: Arc::clone(&self.prober),
                self_tx: tx.clone(),
                health: HashMap::new(),
                tasks: HashMap::new(),
                seen_tasks: false,
            };
            tokio::spawn(supervisor.run(rx));
            supervisors.insert(key.clone(), SupervisorHandle { key, tx });
        }
    }

    /// Stop supervisors of an app, optionally keeping one version.
    pub async fn retire(&self, app_id: &PathId, keep_version: Option<Timestamp>) {
        let mut supervisors = self.supervisors.write().await;
        let retired: Vec<SupervisorKey> = supervisors
            .keys()
            .filter(|k| k.app_id == *app_id && Some(k.version) != keep_version)
            .cloned()
            .collect();
        for key in retired {
            if let Some(handle) = supervisors.remove(&key) {
                handle.stop().await;
            }
        }
    }

    /// Handles of the supervisors watching one app version.
    pub async fn handles(&self, app_id: &PathId, version: Timestamp) -> Vec<SupervisorHandle> {
        self.supervisors
            .read()
            .await
            .values()
            .filter(|h| h.key.app_id == *app_id && h.key.version == version && !h.is_closed())
            .cloned()
            .collect()
    }

    /// Number of tasks alive in every check of this app version, or
    /// `None` when nothing supervises it (no checks declared).
    pub async fn alive_count(&self, app: &AppSpec) -> Option<usize> {
        let handles = self.handles(&app.id, app.version).await;
        if handles.is_empty() {
            return None;
        }
        let mut alive: Option<HashSet<TaskId>> = None;
        for handle in handles {
            let healthy: HashSet<TaskId> = handle
                .app_health()
                .await
                .into_iter()
                .filter(|h| h.alive)
                .map(|h| h.task_id)
                .collect();
            alive = Some(match alive {
                None => healthy,
                Some(prev) => prev.intersection(&healthy).cloned().collect(),
            });
        }
        alive.map(|set| set.len())
    }

    /// Deliver an externally produced probe result (COMMAND checks are
    /// delivered by the task runtime).
    #[allow(dead_code)] // Wired by the task-runtime transport
    pub async fn deliver(
        &self,
        key: &SupervisorKey,
        task_id: TaskId,
        outcome: ProbeOutcome,
    ) {
        let handle = self.supervisors.read().await.get(key).cloned();
        if let Some(handle) = handle {
            handle.deliver(task_id, key.version, outcome).await;
        }
    }
}
