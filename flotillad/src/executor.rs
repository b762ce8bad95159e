//! Deployment execution.
//!
//! The executor drives a plan's steps sequentially, fanning the actions
//! of each step out concurrently. Every deployment carries a cancellation
//! token (a watch channel): force-updates flip it and in-flight requests
//! drain instead of dangling.

use crate::events::{Event, EventBus};
use crate::health::HealthRegistry;
use flotilla_core::{
    Action, AppSpec, DeploymentPlan, KillReason, PathId, Repository, TaskLaunchFacade, TaskState,
    TaskStatus, Timestamp,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often convergence conditions are re-checked.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
enum ActionError {
    Canceled,
    Failed(String),
}

struct ActiveDeployment {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
    affected: BTreeSet<PathId>,
    version: Timestamp,
    current_step: Arc<AtomicUsize>,
    total_steps: usize,
}

/// A running deployment as reported by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub id: Uuid,
    pub version: Timestamp,
    pub affected_apps: Vec<PathId>,
    pub current_step: usize,
    pub total_steps: usize,
}

/// Drives deployment plans against the task-launch facade.
pub struct DeploymentExecutor {
    facade: Arc<dyn TaskLaunchFacade>,
    repo: Arc<dyn Repository>,
    health: Arc<HealthRegistry>,
    events: EventBus,
    config: ExecutorConfig,
    /// Consecutive launch failures per app since the last success.
    /// Scaling keeps the counter; configuration changes reset it.
    launch_failures: Mutex<HashMap<PathId, u32>>,
    active: RwLock<HashMap<Uuid, ActiveDeployment>>,
}

impl DeploymentExecutor {
    pub fn new(
        facade: Arc<dyn TaskLaunchFacade>,
        repo: Arc<dyn Repository>,
        health: Arc<HealthRegistry>,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            facade,
            repo,
            health,
            events,
            config,
            launch_failures: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Start driving a plan. Returns immediately with the plan id; the
    /// outcome arrives on the event bus.
    pub async fn start(self: &Arc<Self>, plan: DeploymentPlan) -> Uuid {
        let id = plan.id;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let current_step = Arc::new(AtomicUsize::new(0));
        let affected = plan.affected_ids();
        let version = plan.version;
        let total_steps = plan.steps.len();
        // Register under the lock before the task can reach `finish`,
        // which removes the entry through the same lock.
        let mut active = self.active.write().await;
        let join = {
            let this = Arc::clone(self);
            let progress = Arc::clone(&current_step);
            tokio::spawn(async move { this.run(plan, cancel_rx, progress).await })
        };
        active.insert(
            id,
            ActiveDeployment {
                cancel: cancel_tx,
                affected,
                version,
                current_step,
                total_steps,
                join,
            },
        );
        id
    }

    /// Id of some in-flight deployment, if any.
    pub async fn first_active(&self) -> Option<Uuid> {
        self.active.read().await.keys().min().copied()
    }

    /// Summaries of every in-flight deployment, ordered by id.
    pub async fn list(&self) -> Vec<DeploymentSummary> {
        let active = self.active.read().await;
        let mut out: Vec<DeploymentSummary> = active
            .iter()
            .map(|(id, dep)| DeploymentSummary {
                id: *id,
                version: dep.version,
                affected_apps: dep.affected.iter().cloned().collect(),
                current_step: dep.current_step.load(Ordering::SeqCst),
                total_steps: dep.total_steps,
            })
            .collect();
        out.sort_by_key(|d| d.id);
        out
    }

    /// Request cancellation without waiting. Returns false for unknown
    /// ids.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let active = self.active.read().await;
        match active.get(&id) {
            Some(dep) => {
                let _ = dep.cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Cancel an in-flight deployment and wait for its actions to drain.
    pub async fn cancel_and_wait(&self, id: Uuid) {
        let entry = self.active.write().await.remove(&id);
        if let Some(dep) = entry {
            let _ = dep.cancel.send(true);
            if let Err(err) = dep.join.await {
                warn!(deployment = %id, "deployment task panicked during cancel: {err}");
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        plan: DeploymentPlan,
        cancel: watch::Receiver<bool>,
        current_step: Arc<AtomicUsize>,
    ) {
        let id = plan.id;
        let total = plan.steps.len();
        info!(deployment = %id, steps = total, "deployment started");

        for (index, step) in plan.steps.iter().enumerate() {
            if *cancel.borrow() {
                self.finish_canceled(id).await;
                return;
            }
            current_step.store(index + 1, Ordering::SeqCst);
            self.events.publish(&Event::DeploymentInfo {
                id,
                step: index + 1,
                total_steps: total,
            });

            let mut set = JoinSet::new();
            for action in step.actions.clone() {
                let this = Arc::clone(&self);
                let cancel = cancel.clone();
                set.spawn(async move { this.perform(action, cancel).await });
            }

            let mut canceled = false;
            let mut failure: Option<String> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(ActionError::Canceled)) => canceled = true,
                    Ok(Err(ActionError::Failed(reason))) => {
                        failure.get_or_insert(reason);
                    }
                    Err(err) => {
                        failure.get_or_insert(format!("action task failed: {err}"));
                    }
                }
            }
            if canceled {
                self.finish_canceled(id).await;
                return;
            }
            if let Some(reason) = failure {
                warn!(deployment = %id, step = index + 1, "deployment failed: {reason}");
                self.events.publish(&Event::DeploymentFailed { id, reason });
                self.finish(id).await;
                return;
            }
        }

        info!(deployment = %id, "deployment succeeded");
        self.events.publish(&Event::DeploymentSuccess { id });
        self.finish(id).await;
    }

    async fn finish_canceled(&self, id: Uuid) {
        info!(deployment = %id, "deployment canceled");
        self.events.publish(&Event::DeploymentCanceled { id });
        self.finish(id).await;
    }

    async fn finish(&self, id: Uuid) {
        if let Err(err) = self.repo.remove_plan(id).await {
            warn!(deployment = %id, "failed to remove stored plan: {err}");
        }
        self.active.write().await.remove(&id);
    }

    async fn perform(
        &self,
        action: Action,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ActionError> {
        match action {
            Action::Start { app } => {
                self.health.watch(&app).await;
                self.converge_scale(&app, app.instances, &mut cancel).await
            }
            Action::Scale { app, to, .. } => {
                self.health.watch(&app).await;
                self.converge_scale(&app, to, &mut cancel).await
            }
            Action::Stop { id } => {
                self.stop_app(&id).await;
                Ok(())
            }
            Action::Restart {
                app,
                from_instances,
                ..
            } => {
                // A configuration change resets the launch backoff.
                self.launch_failures.lock().await.remove(&app.id);
                self.health.watch(&app).await;
                self.rolling_restart(&app, from_instances, &mut cancel).await
            }
        }
    }

    /// Staging or running tasks of an app, across versions. Scaling is
    /// version-agnostic: only a restart replaces existing tasks.
    async fn live_tasks(&self, id: &PathId) -> Vec<TaskStatus> {
        self.facade
            .tasks(id)
            .await
            .into_iter()
            .filter(|t| matches!(t.state, TaskState::Staging | TaskState::Running))
            .collect()
    }

    /// Healthy instances of the target version: running tasks when the
    /// app declares no checks, otherwise the supervisor's alive count.
    async fn healthy_count(&self, app: &AppSpec, running: usize) -> usize {
        if app.health_checks.is_empty() {
            return running;
        }
        self.health
            .alive_count(app)
            .await
            .unwrap_or(0)
            .min(running)
    }

    /// Launch or kill until exactly `target` tasks of the app run.
    async fn converge_scale(
        &self,
        app: &AppSpec,
        target: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ActionError> {
        let mut delay_spent = 0.0f64;
        loop {
            if *cancel.borrow() {
                return Err(ActionError::Canceled);
            }
            let live = self.live_tasks(&app.id).await;
            let running = live
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .count();

            if live.len() as u32 > target {
                self.kill_excess(app, &live, live.len() - target as usize, KillReason::Scaling)
                    .await;
            } else if (live.len() as u32) < target {
                self.launch_one(app, &mut delay_spent, cancel).await?;
                continue;
            } else if running as u32 >= target {
                return Ok(());
            }
            self.sleep_or_cancel(self.config.poll_interval, cancel)
                .await?;
        }
    }

    /// Kill `count` tasks, most recently started first.
    async fn kill_excess(
        &self,
        app: &AppSpec,
        live: &[TaskStatus],
        count: usize,
        reason: KillReason,
    ) {
        let mut victims: Vec<&TaskStatus> = live.iter().collect();
        victims.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        for task in victims.into_iter().take(count) {
            self.facade.kill(&task.id, reason).await;
            self.events.publish(&Event::StatusUpdateEvent {
                app_id: app.id.clone(),
                task_id: task.id.clone(),
                version: task.version,
                state: TaskState::Killed,
            });
        }
    }

    /// One launch attempt with exponential backoff on failure. Fails the
    /// action once the app's launch-delay budget is exhausted.
    async fn launch_one(
        &self,
        app: &AppSpec,
        delay_spent: &mut f64,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ActionError> {
        match self.facade.launch(app).await {
            Ok(status) => {
                self.launch_failures.lock().await.remove(&app.id);
                self.events.publish(&Event::StatusUpdateEvent {
                    app_id: app.id.clone(),
                    task_id: status.id,
                    version: status.version,
                    state: status.state,
                });
                Ok(())
            }
            Err(err) => {
                let failures = {
                    let mut map = self.launch_failures.lock().await;
                    let counter = map.entry(app.id.clone()).or_insert(0);
                    let before = *counter;
                    *counter += 1;
                    before
                };
                let delay = app.backoff.delay_seconds(failures);
                *delay_spent += delay;
                if *delay_spent > app.backoff.max_launch_delay_seconds {
                    return Err(ActionError::Failed(format!(
                        "launch backoff exhausted for '{}': {err}",
                        app.id
                    )));
                }
                debug!(app = %app.id, failures = failures + 1, delay, "launch failed, backing off");
                self.sleep_or_cancel(Duration::from_secs_f64(delay), cancel)
                    .await
            }
        }
    }

    /// Kill every task of a removed app and retire its supervisors.
    async fn stop_app(&self, id: &PathId) {
        for task in self.facade.tasks(id).await {
            self.facade.kill(&task.id, KillReason::Removed).await;
            self.events.publish(&Event::StatusUpdateEvent {
                app_id: id.clone(),
                task_id: task.id,
                version: task.version,
                state: TaskState::Killed,
            });
        }
        self.health.retire(id, None).await;
    }

    /// Rolling upgrade. Never lets the healthy count drop below
    /// `⌈from · minimumHealthCapacity⌉` and never exceeds
    /// `⌈from · (1 + maximumOverCapacity)⌉` total instances. Both bounds
    /// are hard; a strategy that leaves no room to launch or kill fails
    /// the deployment instead of breaching them.
    async fn rolling_restart(
        &self,
        app: &AppSpec,
        from_instances: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ActionError> {
        let target = app.instances;
        // With no prior instances there is no capacity to protect.
        if from_instances == 0 {
            return self.converge_scale(app, target, cancel).await;
        }
        let min_healthy =
            (from_instances as f64 * app.upgrade_strategy.minimum_health_capacity).ceil() as u32;
        let max_total = (from_instances as f64
            * (1.0 + app.upgrade_strategy.maximum_over_capacity))
            .ceil() as u32;
        if max_total <= min_healthy {
            return Err(ActionError::Failed(format!(
                "rolling restart of '{}' cannot make progress: \
                 minimumHealthCapacity {} and maximumOverCapacity {} leave \
                 no room to launch or kill",
                app.id,
                app.upgrade_strategy.minimum_health_capacity,
                app.upgrade_strategy.maximum_over_capacity,
            )));
        }
        let mut delay_spent = 0.0f64;

        loop {
            if *cancel.borrow() {
                return Err(ActionError::Canceled);
            }
            let tasks = self.facade.tasks(&app.id).await;
            let old: Vec<TaskStatus> = tasks
                .iter()
                .filter(|t| t.version != app.version && t.state == TaskState::Running)
                .cloned()
                .collect();
            let new_live: Vec<TaskStatus> = tasks
                .iter()
                .filter(|t| {
                    t.version == app.version
                        && matches!(t.state, TaskState::Staging | TaskState::Running)
                })
                .cloned()
                .collect();
            let new_running = new_live
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .count();
            let healthy_new = self.healthy_count(app, new_running).await as u32;

            if old.is_empty() && healthy_new >= target {
                self.health.retire(&app.id, Some(app.version)).await;
                return Ok(());
            }

            let total = (old.len() + new_live.len()) as u32;
            if (new_live.len() as u32) < target && total < max_total {
                self.launch_one(app, &mut delay_spent, cancel).await?;
                continue;
            }

            // Old running instances count as healthy capacity.
            let healthy_total = old.len() as u32 + healthy_new;
            let killable = healthy_total
                .saturating_sub(min_healthy)
                .min(old.len() as u32);
            if killable > 0 {
                let mut victims: Vec<&TaskStatus> = old.iter().collect();
                victims.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
                for task in victims.into_iter().take(killable as usize) {
                    self.facade.kill(&task.id, KillReason::Upgrade).await;
                    self.events.publish(&Event::StatusUpdateEvent {
                        app_id: app.id.clone(),
                        task_id: task.id.clone(),
                        version: task.version,
                        state: TaskState::Killed,
                    });
                }
                continue;
            }

            self.sleep_or_cancel(self.config.poll_interval, cancel)
                .await?;
        }
    }

    async fn sleep_or_cancel(
        &self,
        duration: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ActionError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            changed = cancel.changed() => {
                if changed.is_ok() && *cancel.borrow() {
                    Err(ActionError::Canceled)
                } else {
                    Ok(())
                }
            }
        }
    }
}
