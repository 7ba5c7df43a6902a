//! Loopback HTTP + WebSocket surface for operational tools.
//!
//! The server binds a random loopback port and publishes `{port, token,
//! pid}` to `data/.ipc-port` with owner-only permissions. Every endpoint
//! except `/healthz` requires `Authorization: Bearer <token>`. A WebSocket
//! at `/ws` pushes a state snapshot every few seconds (identical snapshots
//! are skipped) interleaved with push events.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};
use uuid::Uuid;

use attache_config::IpcConfig;
use attache_cron::CronScheduler;
use attache_llm::CliAdapter;
use attache_queue::WorkQueue;
use attache_store::{Db, DeliveryMode, Goal, GoalStatus, Milestone};
use attache_workflow::{Step, WorkflowEngine};

use crate::auth::{TokenGuard, generate_token};

// ── Events and commands ───────────────────────────────────────────────────────

/// Pushed to subscribed operator tools over the WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PushEvent {
    CronFired { name: String },
    WorkflowChanged { id: Uuid, status: String },
    MemoryIngested { summary: String },
    Notice { text: String },
}

/// Requests the surface cannot satisfy alone; handled by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCommand {
    ClearHistory,
}

// ── Server state ──────────────────────────────────────────────────────────────

pub struct ServerDeps {
    pub db: Arc<Db>,
    pub queue: WorkQueue,
    pub adapter: Arc<CliAdapter>,
    pub cron: Arc<CronScheduler>,
    pub engine: Arc<WorkflowEngine>,
    pub commands: mpsc::UnboundedSender<IpcCommand>,
    pub events: broadcast::Sender<PushEvent>,
    pub config: IpcConfig,
}

struct AppState {
    deps: ServerDeps,
    guard: TokenGuard,
    started_at: Instant,
}

type Shared = Arc<AppState>;

pub struct IpcServer {
    pub port: u16,
    pub token: String,
    port_file: PathBuf,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Serialize)]
struct PortFile<'a> {
    port: u16,
    token: &'a str,
    pid: u32,
}

impl IpcServer {
    pub async fn start(deps: ServerDeps, port_file: PathBuf) -> anyhow::Result<Self> {
        let token = generate_token();
        let state = Arc::new(AppState {
            guard: TokenGuard::new(&token),
            started_at: Instant::now(),
            deps,
        });

        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        write_port_file(&port_file, port, &token)?;
        info!(port, file = %port_file.display(), "ipc surface listening");

        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(err) = axum::serve(listener, service).await {
                warn!(%err, "ipc server exited");
            }
        });

        Ok(Self { port, token, port_file, handle })
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = std::fs::remove_file(&self.port_file);
    }
}

fn write_port_file(path: &PathBuf, port: u16, token: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(&PortFile { port, token, pid: std::process::id() })?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&body)?;
    }
    #[cfg(not(unix))]
    std::fs::write(path, &body)?;
    Ok(())
}

fn build_router(state: Shared) -> Router {
    let protected = Router::new()
        .route("/status", get(get_status))
        .route("/crons", get(list_crons).post(create_cron))
        .route("/crons/:id/delete", post(delete_cron))
        .route("/crons/:id/toggle", post(toggle_cron))
        .route("/crons/:id/run", post(run_cron))
        .route("/goals", get(list_goals).post(create_goal))
        .route("/goals/:id/update", post(update_goal))
        .route("/goals/:id/delete", post(delete_goal))
        .route("/goals/:id/milestone-add", post(milestone_add))
        .route("/goals/:id/milestone-complete", post(milestone_complete))
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/:id/cancel", post(cancel_workflow))
        .route("/workflows/:id/pause", post(pause_workflow))
        .route("/workflows/:id/resume", post(resume_workflow))
        .route("/workflows/:id/start", post(resume_workflow))
        .route("/metrics", get(get_metrics))
        .route("/clear", post(post_clear))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(state.deps.config.max_body_bytes))
        .with_state(state)
}

// ── Auth middleware ───────────────────────────────────────────────────────────

async fn require_bearer(
    State(state): State<Shared>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !state.guard.verify_header(header) {
        warn!(%peer, path = %request.uri().path(), "ipc auth failure");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }
    next.run(request).await
}

// ── Basic endpoints ───────────────────────────────────────────────────────────

async fn healthz(State(state): State<Shared>) -> impl IntoResponse {
    let errors = state.deps.db.recent_errors(5).unwrap_or_default();
    let recent = errors
        .iter()
        .filter(|e| (chrono::Utc::now() - e.ts).num_minutes() < 10)
        .count();
    let status = if state.deps.queue.stats().draining || recent >= 5 {
        "degraded"
    } else {
        "ok"
    };
    Json(json!({ "status": status }))
}

async fn snapshot(state: &Shared) -> Value {
    let queue = state.deps.queue.stats();
    let costs = state.deps.db.cost_summary().unwrap_or_default();
    let crons = state.deps.cron.list().unwrap_or_default();
    let workflows = state.deps.engine.list().await;
    json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "session_tokens": state.deps.adapter.session_tokens(),
        "session_ceiling": state.deps.adapter.session_token_ceiling(),
        "queue": {
            "in_flight": queue.in_flight,
            "waiting": queue.waiting,
            "total_processed": queue.total_processed,
        },
        "crons": crons.len(),
        "workflows": workflows
            .iter()
            .map(|w| json!({"id": w.id, "name": w.name, "status": w.status}))
            .collect::<Vec<_>>(),
        "costs": { "today_usd": costs.today_usd, "total_usd": costs.total_usd },
    })
}

async fn get_status(State(state): State<Shared>) -> impl IntoResponse {
    Json(snapshot(&state).await)
}

async fn get_metrics(State(state): State<Shared>) -> Result<impl IntoResponse, ApiError> {
    let costs = state.deps.db.cost_summary()?;
    let queue = state.deps.queue.stats();
    let errors = state.deps.db.recent_errors(20)?;
    Ok(Json(json!({
        "costs": costs,
        "queue": {
            "in_flight": queue.in_flight,
            "waiting": queue.waiting,
            "total_processed": queue.total_processed,
        },
        "recent_errors": errors
            .iter()
            .map(|e| json!({"ts": e.ts, "component": e.component, "message": e.message}))
            .collect::<Vec<_>>(),
    })))
}

async fn post_clear(State(state): State<Shared>) -> impl IntoResponse {
    let _ = state.deps.commands.send(IpcCommand::ClearHistory);
    Json(json!({ "ok": true }))
}

// ── Cron endpoints ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateCron {
    name: String,
    schedule: String,
    prompt: String,
    #[serde(default)]
    delivery: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
}

async fn list_crons(State(state): State<Shared>) -> Result<impl IntoResponse, ApiError> {
    let crons = state.deps.cron.list()?;
    Ok(Json(serde_json::to_value(crons).unwrap_or_default()))
}

async fn create_cron(
    State(state): State<Shared>,
    Json(body): Json<CreateCron>,
) -> Result<impl IntoResponse, ApiError> {
    let delivery = body
        .delivery
        .as_deref()
        .map(|d| DeliveryMode::parse(d).ok_or(ApiError::BadRequest("bad delivery mode")))
        .transpose()?
        .unwrap_or_default();
    let job = state
        .deps
        .cron
        .add_job(&body.name, &body.schedule, &body.prompt, delivery, body.model, body.timezone)
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(job).unwrap_or_default())))
}

async fn delete_cron(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.deps.cron.remove_job(&id).await?;
    Ok(Json(json!({ "deleted": job.name })))
}

async fn toggle_cron(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.deps.cron.toggle_job(&id).await?;
    Ok(Json(json!({ "name": job.name, "enabled": job.enabled })))
}

async fn run_cron(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.deps.cron.run_now(&id).await?;
    Ok(Json(json!({ "fired": id })))
}

// ── Goal endpoints ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateGoal {
    title: String,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize)]
struct UpdateGoal {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct MilestoneAdd {
    title: String,
}

#[derive(Deserialize)]
struct MilestoneComplete {
    index: usize,
}

async fn list_goals(State(state): State<Shared>) -> Result<impl IntoResponse, ApiError> {
    let goals = state.deps.db.list_goals()?;
    Ok(Json(serde_json::to_value(goals).unwrap_or_default()))
}

async fn create_goal(
    State(state): State<Shared>,
    Json(body): Json<CreateGoal>,
) -> Result<impl IntoResponse, ApiError> {
    let mut goal = Goal::new(body.title);
    goal.notes = body.notes;
    goal.activity.push((chrono::Utc::now(), "created".to_string()));
    state.deps.db.insert_goal(&goal)?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(goal).unwrap_or_default())))
}

fn parse_goal_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest("bad goal id"))
}

async fn update_goal(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<UpdateGoal>,
) -> Result<impl IntoResponse, ApiError> {
    let mut goal = state.deps.db.get_goal(parse_goal_id(&id)?)?;
    if let Some(title) = body.title {
        goal.title = title;
    }
    if let Some(notes) = body.notes {
        goal.notes = notes;
    }
    if let Some(status) = body.status {
        goal.status =
            GoalStatus::parse(&status).ok_or(ApiError::BadRequest("bad goal status"))?;
    }
    goal.activity.push((chrono::Utc::now(), "updated".to_string()));
    state.deps.db.save_goal(&goal)?;
    Ok(Json(serde_json::to_value(goal).unwrap_or_default()))
}

async fn delete_goal(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.deps.db.delete_goal(parse_goal_id(&id)?)?;
    Ok(Json(json!({ "deleted": id })))
}

async fn milestone_add(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<MilestoneAdd>,
) -> Result<impl IntoResponse, ApiError> {
    let mut goal = state.deps.db.get_goal(parse_goal_id(&id)?)?;
    goal.activity
        .push((chrono::Utc::now(), format!("milestone added: {}", body.title)));
    goal.milestones.push(Milestone { title: body.title, done: false, completed_at: None });
    state.deps.db.save_goal(&goal)?;
    Ok(Json(serde_json::to_value(goal).unwrap_or_default()))
}

async fn milestone_complete(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<MilestoneComplete>,
) -> Result<impl IntoResponse, ApiError> {
    let mut goal = state.deps.db.get_goal(parse_goal_id(&id)?)?;
    let milestone = goal
        .milestones
        .get_mut(body.index)
        .ok_or(ApiError::BadRequest("no such milestone"))?;
    milestone.done = true;
    milestone.completed_at = Some(chrono::Utc::now());
    let title = milestone.title.clone();
    goal.activity
        .push((chrono::Utc::now(), format!("milestone completed: {title}")));
    state.deps.db.save_goal(&goal)?;
    Ok(Json(serde_json::to_value(goal).unwrap_or_default()))
}

// ── Workflow endpoints ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateWorkflow {
    name: String,
    steps: Vec<Step>,
    #[serde(default)]
    max_duration_secs: Option<u64>,
}

async fn list_workflows(State(state): State<Shared>) -> impl IntoResponse {
    let workflows = state.deps.engine.list().await;
    Json(serde_json::to_value(workflows).unwrap_or_default())
}

async fn create_workflow(
    State(state): State<Shared>,
    Json(body): Json<CreateWorkflow>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .deps
        .engine
        .create(&body.name, body.steps, body.max_duration_secs)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

fn parse_wf_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest("bad workflow id"))
}

async fn cancel_workflow(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.deps.engine.cancel(parse_wf_id(&id)?).await?;
    Ok(Json(json!({ "cancelled": id })))
}

async fn pause_workflow(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.deps.engine.pause(parse_wf_id(&id)?).await?;
    Ok(Json(json!({ "paused": id })))
}

async fn resume_workflow(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.deps.engine.resume(parse_wf_id(&id)?).await?;
    Ok(Json(json!({ "resumed": id })))
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

async fn ws_upgrade(State(state): State<Shared>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_session(state, socket))
}

async fn ws_session(state: Shared, mut socket: WebSocket) {
    let mut events = state.deps.events.subscribe();
    let mut interval =
        tokio::time::interval(Duration::from_secs(state.deps.config.snapshot_interval_secs.max(1)));
    let mut last_snapshot = String::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let snap = snapshot(&state).await.to_string();
                if snap == last_snapshot {
                    continue;
                }
                last_snapshot = snap.clone();
                if socket.send(Message::Text(snap)).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(body) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(body)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

// ── Error mapping ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),

    #[error(transparent)]
    Store(#[from] attache_store::StoreError),

    #[error(transparent)]
    Cron(#[from] attache_cron::CronError),

    #[error(transparent)]
    Workflow(#[from] attache_workflow::WorkflowError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(attache_store::StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(attache_store::StoreError::DuplicateName(_)) => StatusCode::CONFLICT,
            ApiError::Cron(attache_cron::CronError::Store(attache_store::StoreError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Cron(attache_cron::CronError::InvalidExpression(..))
            | ApiError::Cron(attache_cron::CronError::InvalidTimezone(_)) => StatusCode::BAD_REQUEST,
            ApiError::Workflow(attache_workflow::WorkflowError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Workflow(attache_workflow::WorkflowError::Graph(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use attache_config::{CronConfig, LlmConfig, WorkflowConfig};
    use attache_cron::CronDelivery;
    use attache_store::PromptArchive;
    use attache_workflow::WorkflowNotify;
    use axum::body::Body;
    use tower::util::ServiceExt;

    struct NullSink;

    #[async_trait]
    impl CronDelivery for NullSink {
        async fn deliver(&self, _job_name: &str, _text: &str) {}
        async fn alert(&self, _message: &str) {}
    }

    #[async_trait]
    impl WorkflowNotify for NullSink {
        async fn ask_user(&self, _workflow_name: &str, _question: &str) {}
        async fn workflow_event(&self, _message: &str) {}
    }

    struct TestApp {
        router: Router,
        state: Shared,
        commands_rx: mpsc::UnboundedReceiver<IpcCommand>,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let queue = WorkQueue::new(2, 4);
        let adapter = Arc::new(CliAdapter::new(
            LlmConfig { command: "/bin/true".to_string(), ..Default::default() },
            dir.path().join("session.json"),
            PromptArchive::new(dir.path().join("prompts")),
            db.clone(),
        ));
        let cron = CronScheduler::new(
            db.clone(),
            queue.clone(),
            adapter.clone(),
            Arc::new(NullSink),
            CronConfig::default(),
        )
        .unwrap();
        let engine = WorkflowEngine::new(
            dir.path().join("workflows"),
            db.clone(),
            queue.clone(),
            adapter.clone(),
            Arc::new(NullSink),
            WorkflowConfig::default(),
        );
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let state = Arc::new(AppState {
            guard: TokenGuard::new("test-token"),
            started_at: Instant::now(),
            deps: ServerDeps {
                db,
                queue,
                adapter,
                cron,
                engine,
                commands,
                events,
                config: IpcConfig::default(),
            },
        });
        TestApp { router: build_router(state.clone()), state, commands_rx, _dir: dir }
    }

    fn request(method: &str, path: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }

    // ConnectInfo is required by the auth middleware; oneshot calls need it
    // injected manually.
    fn with_peer(mut request: Request<Body>) -> Request<Body> {
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    #[tokio::test]
    async fn healthz_is_open_and_ok() {
        let app = test_app();
        let response = app
            .router
            .oneshot(with_peer(request("GET", "/healthz", None, None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn status_requires_bearer_token() {
        let app = test_app();
        let denied = app
            .router
            .clone()
            .oneshot(with_peer(request("GET", "/status", None, None)))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .router
            .clone()
            .oneshot(with_peer(request("GET", "/status", Some("wrong"), None)))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .router
            .oneshot(with_peer(request("GET", "/status", Some("test-token"), None)))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert!(body["queue"]["in_flight"].is_number());
    }

    #[tokio::test]
    async fn cron_crud_over_http() {
        let app = test_app();

        let created = app
            .router
            .clone()
            .oneshot(with_peer(request(
                "POST",
                "/crons",
                Some("test-token"),
                Some(json!({
                    "name": "brief",
                    "schedule": "0 8 * * *",
                    "prompt": "summarise",
                    "delivery": "silent"
                })),
            )))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let job = body_json(created).await;
        let id = job["id"].as_str().unwrap().to_string();

        let listed = app
            .router
            .clone()
            .oneshot(with_peer(request("GET", "/crons", Some("test-token"), None)))
            .await
            .unwrap();
        assert_eq!(body_json(listed).await.as_array().unwrap().len(), 1);

        let toggled = app
            .router
            .clone()
            .oneshot(with_peer(request(
                "POST",
                &format!("/crons/{id}/toggle"),
                Some("test-token"),
                None,
            )))
            .await
            .unwrap();
        assert_eq!(body_json(toggled).await["enabled"], false);

        let deleted = app
            .router
            .clone()
            .oneshot(with_peer(request(
                "POST",
                &format!("/crons/{id}/delete"),
                Some("test-token"),
                None,
            )))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);

        let listed = app
            .router
            .oneshot(with_peer(request("GET", "/crons", Some("test-token"), None)))
            .await
            .unwrap();
        assert!(body_json(listed).await.as_array().unwrap().is_empty());
        app.state.deps.cron.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_a_bad_request() {
        let app = test_app();
        let response = app
            .router
            .oneshot(with_peer(request(
                "POST",
                "/crons",
                Some("test-token"),
                Some(json!({"name": "x", "schedule": "whenever", "prompt": "p"})),
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn goal_milestone_flow() {
        let app = test_app();
        let created = app
            .router
            .clone()
            .oneshot(with_peer(request(
                "POST",
                "/goals",
                Some("test-token"),
                Some(json!({"title": "Learn piano"})),
            )))
            .await
            .unwrap();
        let goal = body_json(created).await;
        let id = goal["id"].as_str().unwrap().to_string();

        app.router
            .clone()
            .oneshot(with_peer(request(
                "POST",
                &format!("/goals/{id}/milestone-add"),
                Some("test-token"),
                Some(json!({"title": "buy a keyboard"})),
            )))
            .await
            .unwrap();

        let done = app
            .router
            .oneshot(with_peer(request(
                "POST",
                &format!("/goals/{id}/milestone-complete"),
                Some("test-token"),
                Some(json!({"index": 0})),
            )))
            .await
            .unwrap();
        let goal = body_json(done).await;
        assert_eq!(goal["milestones"][0]["done"], true);
    }

    #[tokio::test]
    async fn clear_forwards_a_command() {
        let mut app = test_app();
        let response = app
            .router
            .oneshot(with_peer(request("POST", "/clear", Some("test-token"), None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.commands_rx.try_recv().unwrap(), IpcCommand::ClearHistory);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = test_app();
        let huge = "x".repeat(IpcConfig::default().max_body_bytes + 1);
        let response = app
            .router
            .oneshot(with_peer(request(
                "POST",
                "/goals",
                Some("test-token"),
                Some(json!({"title": huge})),
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
