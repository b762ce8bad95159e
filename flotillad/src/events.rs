//! Event broadcast bus for control-plane notifications.
//!
//! Every event is a JSON object carrying `eventType` and `timestamp`.
//! Delivery is at-least-once per subscriber and unordered across topics;
//! slow subscribers lag and drop rather than block publishers.

use flotilla_core::{PathId, TaskId, TaskState, Timestamp};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

/// Smallest ring the bus will run with. A deployment fan-out can emit a
/// dense burst of status events, and a subscriber behind a tiny ring
/// would lose most of the burst.
const MIN_BUFFER: usize = 256;

/// Everything the control plane announces on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    GroupChangeSuccess { group_id: PathId, version: Timestamp },
    #[serde(rename_all = "camelCase")]
    GroupChangeFailed { group_id: PathId, reason: String },
    #[serde(rename_all = "camelCase")]
    DeploymentInfo {
        id: Uuid,
        step: usize,
        total_steps: usize,
    },
    #[serde(rename_all = "camelCase")]
    DeploymentSuccess { id: Uuid },
    #[serde(rename_all = "camelCase")]
    DeploymentFailed { id: Uuid, reason: String },
    #[serde(rename_all = "camelCase")]
    DeploymentCanceled { id: Uuid },
    #[serde(rename_all = "camelCase")]
    ApiPostEvent { uri: String, group_id: PathId },
    #[serde(rename_all = "camelCase")]
    StatusUpdateEvent {
        app_id: PathId,
        task_id: TaskId,
        version: Timestamp,
        state: TaskState,
    },
    #[serde(rename_all = "camelCase")]
    FailedHealthCheck {
        app_id: PathId,
        task_id: TaskId,
        version: Timestamp,
        cause: String,
    },
    #[serde(rename_all = "camelCase")]
    HealthStatusChanged {
        app_id: PathId,
        task_id: TaskId,
        version: Timestamp,
        alive: bool,
    },
    #[serde(rename_all = "camelCase")]
    UnhealthyTaskKillEvent {
        app_id: PathId,
        task_id: TaskId,
        version: Timestamp,
        reason: String,
    },
}

impl Event {
    /// The wire name of the event, as it appears in `eventType`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::GroupChangeSuccess { .. } => "group_change_success",
            Event::GroupChangeFailed { .. } => "group_change_failed",
            Event::DeploymentInfo { .. } => "deployment_info",
            Event::DeploymentSuccess { .. } => "deployment_success",
            Event::DeploymentFailed { .. } => "deployment_failed",
            Event::DeploymentCanceled { .. } => "deployment_canceled",
            Event::ApiPostEvent { .. } => "api_post_event",
            Event::StatusUpdateEvent { .. } => "status_update_event",
            Event::FailedHealthCheck { .. } => "failed_health_check",
            Event::HealthStatusChanged { .. } => "health_status_changed",
            Event::UnhealthyTaskKillEvent { .. } => "unhealthy_task_kill_event",
        }
    }
}

/// Fan-out bus carrying serialized control-plane events as JSON lines.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Build a bus whose ring holds at least `buffer` events. Requests
    /// below [`MIN_BUFFER`] are raised to it.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(MIN_BUFFER));
        Self { sender }
    }

    /// Attach a subscriber; it observes events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Publish an event, stamping the emission time.
    pub fn publish(&self, event: &Event) {
        match serde_json::to_value(event) {
            Ok(Value::Object(mut payload)) => {
                payload.insert(
                    "timestamp".to_string(),
                    Value::String(Timestamp::now().to_string()),
                );
                let _ = self.sender.send(Value::Object(payload).to_string());
            }
            Ok(other) => warn!("event serialized to non-object payload: {other}"),
            Err(err) => warn!("failed to serialize {} event: {err}", event.event_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn undersized_buffers_survive_a_deployment_burst() {
        // Ask for a ring of 4; the bus raises it so a burst of step
        // events the size of the minimum reaches a slow subscriber
        // intact, starting from the first step.
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for step in 0..MIN_BUFFER {
            bus.publish(&Event::DeploymentInfo {
                id: Uuid::nil(),
                step,
                total_steps: MIN_BUFFER,
            });
        }

        let msg = rx.recv().await.expect("subscriber fell behind the ring");
        let first: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(first["step"], 0);
    }

    #[tokio::test]
    async fn publish_sends_json_with_event_type_and_timestamp() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();

        bus.publish(&Event::DeploymentSuccess { id: Uuid::nil() });

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("no event arrived")
            .expect("bus closed with no publishers left");

        let parsed: Value = serde_json::from_str(&msg).expect("event is not valid JSON");
        assert_eq!(parsed["eventType"], "deployment_success");
        assert_eq!(parsed["id"], Uuid::nil().to_string());
        let stamped = parsed["timestamp"].as_str().expect("missing timestamp");
        stamped
            .parse::<Timestamp>()
            .expect("timestamp is not RFC 3339");
    }

    #[tokio::test]
    async fn event_fields_use_camel_case() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();

        bus.publish(&Event::GroupChangeSuccess {
            group_id: PathId::parse("/a").unwrap(),
            version: Timestamp::zero(),
        });

        let msg = rx.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["eventType"], "group_change_success");
        assert_eq!(parsed["groupId"], "/a");
    }
}
