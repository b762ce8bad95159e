//! HTTP API of the control plane.
//!
//! A thin façade mapping the declarative `/v2/groups` surface onto the
//! [`GroupManager`], plus deployment introspection, the event stream, and
//! the daemon health endpoint. Group ids contain `/`, so the router
//! captures a wildcard and the handlers strip the literal
//! `versions[/{v}]` suffix themselves.

use crate::events::{Event, EventBus};
use crate::executor::DeploymentExecutor;
use crate::manager::GroupManager;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path as UrlPath, RawQuery, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response, Sse, sse},
    routing::get,
};
use flotilla_core::{
    Group, GroupUpdate, OrchestratorError, PathId, TaskLaunchFacade, TaskState, TaskStatus,
    Timestamp,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

/// Action a caller wants to perform, for authorization purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    View,
    Update,
}

/// Capability interface consulted before every request touches state.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        action: AuthAction,
        resource: &PathId,
    ) -> Result<(), OrchestratorError>;
}

/// Default authorizer: everything is allowed.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _: AuthAction, _: &PathId) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<GroupManager>,
    pub executor: Arc<DeploymentExecutor>,
    pub facade: Arc<dyn TaskLaunchFacade>,
    pub events: EventBus,
    pub authorizer: Arc<dyn Authorizer>,
    pub started_at: Instant,
    pub version: &'static str,
}

/// Create the control-plane router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/v2/groups",
            get(get_root).post(post_root).put(put_root),
        )
        .route(
            "/v2/groups/{*path}",
            get(get_group)
                .post(post_group)
                .put(put_group)
                .delete(delete_group),
        )
        .route("/v2/deployments", get(list_deployments))
        .route(
            "/v2/deployments/{id}",
            axum::routing::delete(cancel_deployment),
        )
        .route("/v2/events", get(event_stream))
        .with_state(Arc::new(state))
}

// ── Query handling ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ApiQuery {
    force: bool,
    dry_run: bool,
    embed: Vec<String>,
}

fn flag(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_query(raw: Option<&str>) -> ApiQuery {
    let mut query = ApiQuery::default();
    let Some(raw) = raw else {
        return query;
    };
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "force" => query.force = flag(value),
            "dryRun" => query.dry_run = flag(value),
            "embed" => query.embed.push(value.to_string()),
            _ => {}
        }
    }
    query
}

#[derive(Debug, Clone, Copy)]
struct EmbedSet {
    apps: bool,
    pods: bool,
    groups: bool,
    tasks: bool,
    counts: bool,
}

impl EmbedSet {
    /// Default when unset: `{apps, pods, groups}`.
    fn parse(values: &[String]) -> Self {
        if values.is_empty() {
            return Self {
                apps: true,
                pods: true,
                groups: true,
                tasks: false,
                counts: false,
            };
        }
        let mut set = Self {
            apps: false,
            pods: false,
            groups: false,
            tasks: false,
            counts: false,
        };
        for value in values {
            match value.strip_prefix("group.").unwrap_or(value) {
                "apps" => set.apps = true,
                "pods" => set.pods = true,
                "groups" => set.groups = true,
                "apps.tasks" => {
                    set.apps = true;
                    set.tasks = true;
                }
                "apps.counts" => {
                    set.apps = true;
                    set.counts = true;
                }
                _ => {}
            }
        }
        set
    }
}

// ── Rendering ────────────────────────────────────────────────────────────

async fn render_group(state: &ApiState, group: &Group, embed: EmbedSet) -> Value {
    let mut tasks_by_app: HashMap<PathId, Vec<TaskStatus>> = HashMap::new();
    if embed.tasks || embed.counts {
        for app in group.transitive_apps() {
            let tasks = state
                .facade
                .tasks(&app.id)
                .await
                .into_iter()
                .filter(|t| t.state == TaskState::Running)
                .collect();
            tasks_by_app.insert(app.id.clone(), tasks);
        }
    }
    group_json(group, embed, &tasks_by_app)
}

fn group_json(
    group: &Group,
    embed: EmbedSet,
    tasks_by_app: &HashMap<PathId, Vec<TaskStatus>>,
) -> Value {
    let mut body = json!({
        "id": group.id,
        "version": group.version,
        "dependencies": group.dependencies,
    });
    if embed.apps {
        let apps: Vec<Value> = group
            .apps
            .values()
            .map(|app| {
                let mut rendered = serde_json::to_value(app).unwrap_or_else(|_| json!({}));
                let tasks = tasks_by_app.get(&app.id);
                if embed.counts {
                    rendered["tasksRunning"] =
                        json!(tasks.map(|t| t.len()).unwrap_or_default());
                }
                if embed.tasks {
                    rendered["tasks"] = json!(tasks.cloned().unwrap_or_default());
                }
                rendered
            })
            .collect();
        body["apps"] = json!(apps);
    }
    if embed.pods {
        // Pods are not modeled; the embed is accepted for compatibility.
        body["pods"] = json!([]);
    }
    if embed.groups {
        let groups: Vec<Value> = group
            .groups
            .values()
            .map(|g| group_json(g, embed, tasks_by_app))
            .collect();
        body["groups"] = json!(groups);
    }
    body
}

fn error_response(err: OrchestratorError) -> Response {
    let (status, body) = match &err {
        OrchestratorError::Validation(details) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "message": "Object is not valid", "details": details }),
        ),
        OrchestratorError::InvalidHierarchy { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "message": "Object is not valid", "details": [err.to_string()] }),
        ),
        OrchestratorError::ConflictingPath(_) => {
            (StatusCode::CONFLICT, json!({ "message": err.to_string() }))
        }
        OrchestratorError::UnknownGroup(_) | OrchestratorError::UnknownVersion { .. } => {
            (StatusCode::NOT_FOUND, json!({ "message": err.to_string() }))
        }
        OrchestratorError::DeploymentInProgress { deployment } => (
            StatusCode::CONFLICT,
            json!({ "message": err.to_string(), "deploymentId": deployment }),
        ),
        OrchestratorError::Authentication => (
            StatusCode::UNAUTHORIZED,
            json!({ "message": err.to_string() }),
        ),
        OrchestratorError::Authorization { .. } => {
            (StatusCode::FORBIDDEN, json!({ "message": err.to_string() }))
        }
        OrchestratorError::Repository(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "message": err.to_string() }),
        ),
    };
    (status, Json(body)).into_response()
}

fn parse_group_path(raw: &str) -> Result<PathId, OrchestratorError> {
    PathId::parse(&format!("/{raw}"))
        .map_err(|err| OrchestratorError::invalid(err.to_string()))
}

// ── Group reads ──────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": std::process::id(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn get_root(State(state): State<Arc<ApiState>>, RawQuery(raw): RawQuery) -> Response {
    serve_group(&state, PathId::root(), parse_query(raw.as_deref())).await
}

async fn get_group(
    State(state): State<Arc<ApiState>>,
    UrlPath(path): UrlPath<String>,
    RawQuery(raw): RawQuery,
) -> Response {
    let query = parse_query(raw.as_deref());
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    // `/v2/groups/{id}/versions` and `/v2/groups/{id}/versions/{v}` share
    // the wildcard with plain group reads.
    if segments.last() == Some(&"versions") {
        let id = match parse_group_path(&segments[..segments.len() - 1].join("/")) {
            Ok(id) => id,
            Err(err) => return error_response(err),
        };
        return serve_versions(&state, id).await;
    }
    if segments.len() >= 2 && segments[segments.len() - 2] == "versions" {
        let id = match parse_group_path(&segments[..segments.len() - 2].join("/")) {
            Ok(id) => id,
            Err(err) => return error_response(err),
        };
        let version = match segments[segments.len() - 1].parse::<Timestamp>() {
            Ok(version) => version,
            Err(_) => {
                return error_response(OrchestratorError::UnknownGroup(id));
            }
        };
        return serve_group_version(&state, id, version, query).await;
    }

    match parse_group_path(&path) {
        Ok(id) => serve_group(&state, id, query).await,
        Err(err) => error_response(err),
    }
}

async fn serve_group(state: &ApiState, id: PathId, query: ApiQuery) -> Response {
    if let Err(err) = state.authorizer.authorize(AuthAction::View, &id).await {
        return error_response(err);
    }
    let embed = EmbedSet::parse(&query.embed);
    match state.manager.group(&id).await {
        Some(group) => Json(render_group(state, &group, embed).await).into_response(),
        None => error_response(OrchestratorError::UnknownGroup(id)),
    }
}

async fn serve_versions(state: &ApiState, id: PathId) -> Response {
    if let Err(err) = state.authorizer.authorize(AuthAction::View, &id).await {
        return error_response(err);
    }
    match state.manager.versions(&id).await {
        Ok(versions) if versions.is_empty() => {
            error_response(OrchestratorError::UnknownGroup(id))
        }
        Ok(versions) => Json(json!(
            versions.iter().map(Timestamp::to_string).collect::<Vec<_>>()
        ))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn serve_group_version(
    state: &ApiState,
    id: PathId,
    version: Timestamp,
    query: ApiQuery,
) -> Response {
    if let Err(err) = state.authorizer.authorize(AuthAction::View, &id).await {
        return error_response(err);
    }
    match state.manager.group_at(&id, version).await {
        Ok(Some(group)) => {
            let embed = EmbedSet::parse(&query.embed);
            Json(render_group(state, &group, embed).await).into_response()
        }
        Ok(None) => error_response(OrchestratorError::UnknownVersion { id, version }),
        Err(err) => error_response(err),
    }
}

// ── Group mutations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationKind {
    Create,
    Upsert,
}

async fn post_root(
    State(state): State<Arc<ApiState>>,
    RawQuery(raw): RawQuery,
    Json(update): Json<GroupUpdate>,
) -> Response {
    mutate(&state, PathId::root(), parse_query(raw.as_deref()), update, MutationKind::Create).await
}

async fn put_root(
    State(state): State<Arc<ApiState>>,
    RawQuery(raw): RawQuery,
    Json(update): Json<GroupUpdate>,
) -> Response {
    mutate(&state, PathId::root(), parse_query(raw.as_deref()), update, MutationKind::Upsert).await
}

async fn post_group(
    State(state): State<Arc<ApiState>>,
    UrlPath(path): UrlPath<String>,
    RawQuery(raw): RawQuery,
    Json(update): Json<GroupUpdate>,
) -> Response {
    match parse_group_path(&path) {
        Ok(base) => mutate(&state, base, parse_query(raw.as_deref()), update, MutationKind::Create)
            .await,
        Err(err) => error_response(err),
    }
}

async fn put_group(
    State(state): State<Arc<ApiState>>,
    UrlPath(path): UrlPath<String>,
    RawQuery(raw): RawQuery,
    Json(update): Json<GroupUpdate>,
) -> Response {
    match parse_group_path(&path) {
        Ok(base) => mutate(&state, base, parse_query(raw.as_deref()), update, MutationKind::Upsert)
            .await,
        Err(err) => error_response(err),
    }
}

async fn delete_group(
    State(state): State<Arc<ApiState>>,
    UrlPath(path): UrlPath<String>,
    RawQuery(raw): RawQuery,
) -> Response {
    let query = parse_query(raw.as_deref());
    let id = match parse_group_path(&path) {
        Ok(id) => id,
        Err(err) => return error_response(err),
    };
    if let Err(err) = state.authorizer.authorize(AuthAction::Update, &id).await {
        return error_response(err);
    }
    match state.manager.delete_group(&id, query.force).await {
        Ok(plan) => {
            state.events.publish(&Event::ApiPostEvent {
                uri: format!("/v2/groups{id}"),
                group_id: id,
            });
            Json(json!({ "deploymentId": plan.id, "version": plan.version })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn mutate(
    state: &ApiState,
    base: PathId,
    query: ApiQuery,
    update: GroupUpdate,
    kind: MutationKind,
) -> Response {
    let target = update
        .id
        .as_ref()
        .map(|id| id.canonical_path(&base))
        .unwrap_or(base);
    if let Err(err) = state.authorizer.authorize(AuthAction::Update, &target).await {
        return error_response(err);
    }

    // Only PUT honors dryRun.
    let dry_run = query.dry_run && kind == MutationKind::Upsert;
    let create_only = kind == MutationKind::Create;
    match state
        .manager
        .apply_update(&target, update, query.force, dry_run, create_only)
        .await
    {
        Ok(plan) if dry_run => Json(json!({ "steps": plan.steps_json() })).into_response(),
        Ok(plan) => {
            state.events.publish(&Event::ApiPostEvent {
                uri: format!("/v2/groups{target}"),
                group_id: target.clone(),
            });
            let body = json!({ "deploymentId": plan.id, "version": plan.version });
            match kind {
                MutationKind::Create => (
                    StatusCode::CREATED,
                    [(header::LOCATION, target.to_string())],
                    Json(body),
                )
                    .into_response(),
                MutationKind::Upsert => Json(body).into_response(),
            }
        }
        Err(err) => error_response(err),
    }
}

// ── Deployments ──────────────────────────────────────────────────────────

async fn list_deployments(State(state): State<Arc<ApiState>>) -> Response {
    Json(json!(state.executor.list().await)).into_response()
}

async fn cancel_deployment(
    State(state): State<Arc<ApiState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "malformed deployment id" })),
        )
            .into_response();
    };
    if state.executor.cancel(id).await {
        Json(json!({ "deploymentId": id })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("deployment {id} does not exist") })),
        )
            .into_response()
    }
}

// ── Event stream ─────────────────────────────────────────────────────────

async fn event_stream(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = BroadcastStream::new(receiver)
        .filter_map(|message| message.ok())
        .map(|line| Ok(sse::Event::default().data(line)));
    Sse::new(stream)
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::health::{HealthRegistry, NetworkProber};
    use flotilla_core::{
        AppSpec, BackoffStrategy, InMemoryRepository, MockCluster, Repository,
    };
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    struct TestApi {
        router: Router,
        state: ApiState,
        cluster: Arc<MockCluster>,
        events: broadcast::Receiver<String>,
    }

    async fn test_api_with_authorizer(authorizer: Arc<dyn Authorizer>) -> TestApi {
        let repo = Arc::new(InMemoryRepository::new());
        let cluster = Arc::new(MockCluster::new());
        let bus = EventBus::new(256);
        let events = bus.subscribe();
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
            bus.clone(),
        )
        .await
        .unwrap();
        let state = ApiState {
            manager,
            executor,
            facade: cluster.clone() as Arc<dyn TaskLaunchFacade>,
            events: bus,
            authorizer,
            started_at: Instant::now(),
            version: "0.0.0-test",
        };
        TestApi {
            router: create_router(state.clone()),
            state,
            cluster,
            events,
        }
    }

    async fn test_api() -> TestApi {
        test_api_with_authorizer(Arc::new(AllowAll)).await
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value, Option<String>) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value, location)
    }

    async fn wait_converged(api: &TestApi) {
        for _ in 0..500 {
            if api.state.executor.first_active().await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment did not converge");
    }

    async fn drain_events(rx: &mut broadcast::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Ok(msg)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn health_endpoint_reports_daemon_status() {
        let api = test_api().await;
        let (status, body, _) = send(&api.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], "0.0.0-test");
    }

    #[tokio::test]
    async fn create_group_returns_created_with_location() {
        let api = test_api().await;
        let (status, body, location) = send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [{ "id": "b", "cmd": "run", "instances": 1 }] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(location.as_deref(), Some("/a"));
        assert!(body["deploymentId"].is_string());
        assert!(body["version"].is_string());
        wait_converged(&api).await;

        let (status, body, _) = send(&api.router, "GET", "/v2/groups/a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "/a");
        assert_eq!(body["apps"][0]["id"], "/a/b");
        assert_eq!(body["apps"][0]["instances"], 1);
    }

    #[tokio::test]
    async fn double_create_conflicts() {
        let api = test_api().await;
        let update = json!({ "id": "/a", "apps": [{ "id": "b", "cmd": "run" }] });
        let (status, _, _) = send(&api.router, "POST", "/v2/groups", Some(update.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        wait_converged(&api).await;

        let (status, _, _) = send(&api.router, "POST", "/v2/groups", Some(update)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn scale_by_deploys_and_applies_ceiling() {
        let api = test_api().await;
        send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [{ "id": "b", "cmd": "run", "instances": 1 }] })),
        )
        .await;
        wait_converged(&api).await;

        // The dry-run shows a single scale action 1 -> 3.
        let (status, body, _) = send(
            &api.router,
            "PUT",
            "/v2/groups/a?dryRun=true",
            Some(json!({ "scaleBy": 2.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let steps = body["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 1);
        let action = &steps[0]["actions"][0];
        assert_eq!(action["action"], "ScaleApplication");
        assert_eq!(action["app"], "/a/b");
        assert_eq!(action["from"], 1);
        assert_eq!(action["to"], 3);

        let (status, _, _) = send(
            &api.router,
            "PUT",
            "/v2/groups/a",
            Some(json!({ "scaleBy": 2.5 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        wait_converged(&api).await;

        let (_, body, _) = send(&api.router, "GET", "/v2/groups/a", None).await;
        assert_eq!(body["apps"][0]["instances"], 3);
        // Scaling is version-agnostic: the original task survives and two
        // more are launched.
        let id = PathId::parse("/a/b").unwrap();
        assert_eq!(api.cluster.tasks(&id).await.len(), 3);
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing_and_emits_no_deployment_events() {
        let mut api = test_api().await;
        let before = api.state.manager.root().await.version();
        let (status, body, _) = send(
            &api.router,
            "PUT",
            "/v2/groups/a?dryRun=true",
            Some(json!({ "apps": [{ "id": "b", "cmd": "run" }] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["steps"].is_array());
        assert_eq!(api.state.manager.root().await.version(), before);

        let events = drain_events(&mut api.events).await;
        assert!(
            !events
                .iter()
                .any(|e| e["eventType"] == "deployment_success"),
            "dry run must not deploy, saw: {events:?}"
        );
    }

    #[tokio::test]
    async fn force_override_cancels_the_running_deployment() {
        let mut api = test_api().await;
        // A failing app with a generous budget keeps its deployment alive.
        let stuck = AppSpec {
            backoff: BackoffStrategy {
                initial_seconds: 0.02,
                factor: 1.0,
                max_seconds: 0.02,
                max_launch_delay_seconds: 60.0,
            },
            ..AppSpec::new(PathId::parse("stuck").unwrap())
        };
        api.cluster
            .set_failing(PathId::parse("/a/stuck").unwrap(), true)
            .await;
        let (status, first, _) = send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [serde_json::to_value(&stuck).unwrap()] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let first_id = first["deploymentId"].as_str().unwrap().to_string();

        let (status, body, _) = send(
            &api.router,
            "PUT",
            "/v2/groups/b",
            Some(json!({ "apps": [{ "id": "x", "cmd": "run" }] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["deploymentId"], first_id);

        let (status, second, _) = send(
            &api.router,
            "PUT",
            "/v2/groups/b?force=true",
            Some(json!({ "apps": [{ "id": "x", "cmd": "run" }] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(second["deploymentId"], first_id);
        wait_converged(&api).await;

        let events = drain_events(&mut api.events).await;
        assert!(
            events
                .iter()
                .any(|e| e["eventType"] == "deployment_canceled" && e["id"] == first_id),
            "expected cancellation of {first_id}, saw: {events:?}"
        );
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let api = test_api().await;
        let (status, _, _) = send(&api.router, "GET", "/v2/groups/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn versions_endpoints_serve_history() {
        let api = test_api().await;
        send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [{ "id": "b", "cmd": "run" }] })),
        )
        .await;
        wait_converged(&api).await;

        let (status, body, _) = send(&api.router, "GET", "/v2/groups/a/versions", None).await;
        assert_eq!(status, StatusCode::OK);
        let versions = body.as_array().unwrap();
        assert_eq!(versions.len(), 1);

        let version = versions[0].as_str().unwrap();
        let (status, body, _) = send(
            &api.router,
            "GET",
            &format!("/v2/groups/a/versions/{version}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "/a");

        let (status, _, _) = send(
            &api.router,
            "GET",
            "/v2/groups/a/versions/1970-01-01T00:00:00.000Z",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn embed_counts_and_tasks_extend_app_rendering() {
        let api = test_api().await;
        send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [{ "id": "b", "cmd": "run", "instances": 2 }] })),
        )
        .await;
        wait_converged(&api).await;

        let (_, body, _) = send(
            &api.router,
            "GET",
            "/v2/groups/a?embed=group.apps.counts&embed=group.apps.tasks",
            None,
        )
        .await;
        assert_eq!(body["apps"][0]["tasksRunning"], 2);
        assert_eq!(body["apps"][0]["tasks"].as_array().unwrap().len(), 2);
        // Unrequested sections are omitted.
        assert!(body.get("groups").is_none());
    }

    #[tokio::test]
    async fn delete_group_returns_deployment_and_removes_subtree() {
        let api = test_api().await;
        send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [{ "id": "b", "cmd": "run" }] })),
        )
        .await;
        wait_converged(&api).await;

        let (status, body, _) = send(&api.router, "DELETE", "/v2/groups/a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["deploymentId"].is_string());
        wait_converged(&api).await;

        let (status, _, _) = send(&api.router, "GET", "/v2/groups/a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(&api.router, "DELETE", "/v2/groups/a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deployments_can_be_listed_and_canceled() {
        let mut api = test_api().await;
        let stuck = AppSpec {
            backoff: BackoffStrategy {
                initial_seconds: 0.02,
                factor: 1.0,
                max_seconds: 0.02,
                max_launch_delay_seconds: 60.0,
            },
            ..AppSpec::new(PathId::parse("stuck").unwrap())
        };
        api.cluster
            .set_failing(PathId::parse("/a/stuck").unwrap(), true)
            .await;
        let (_, created, _) = send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [serde_json::to_value(&stuck).unwrap()] })),
        )
        .await;
        let id = created["deploymentId"].as_str().unwrap().to_string();

        let (status, body, _) = send(&api.router, "GET", "/v2/deployments", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], id);
        assert_eq!(list[0]["affectedApps"][0], "/a/stuck");

        let (status, _, _) =
            send(&api.router, "DELETE", &format!("/v2/deployments/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        wait_converged(&api).await;

        let events = drain_events(&mut api.events).await;
        assert!(
            events
                .iter()
                .any(|e| e["eventType"] == "deployment_canceled" && e["id"] == id)
        );

        let (status, _, _) =
            send(&api.router, "DELETE", &format!("/v2/deployments/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn denied_callers_get_forbidden() {
        struct DenyWrites;

        #[async_trait]
        impl Authorizer for DenyWrites {
            async fn authorize(
                &self,
                action: AuthAction,
                resource: &PathId,
            ) -> Result<(), OrchestratorError> {
                match action {
                    AuthAction::View => Ok(()),
                    AuthAction::Update => Err(OrchestratorError::Authorization {
                        action: "update".to_string(),
                        resource: resource.clone(),
                    }),
                }
            }
        }

        let api = test_api_with_authorizer(Arc::new(DenyWrites)).await;
        let (status, _, _) = send(
            &api.router,
            "POST",
            "/v2/groups",
            Some(json!({ "id": "/a", "apps": [{ "id": "b" }] })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, _) = send(&api.router, "GET", "/v2/groups", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_update_is_unprocessable() {
        let api = test_api().await;
        let (status, body, _) = send(
            &api.router,
            "PUT",
            "/v2/groups/a",
            Some(json!({ "scaleBy": 2.0, "apps": [{ "id": "b" }] })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["details"].is_array());
    }
}
