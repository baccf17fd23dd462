use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::audit::{self, AuditMeta};
use super::auth::{self, AuthUser};
use super::credentials::{credential_status, resolve_account_dir};
use super::db::DbHandle;
use super::gate::TaskGate;
use super::limiter::AttemptLimiter;
use super::models::{ModelId, TaskSpec, preview};
use super::oauth::OAuthBroker;
use super::plans::{PlanDocument, PlanLinker, agent_prompt, validate_plan_path};
use super::relay;
use super::step_up::{self, StepUp};
use super::supervisor::{AgentEnv, Supervisor};
use super::tokens::TokenSigner;
use crate::config::MasterConfig;
use crate::errors::{CredentialsError, GateError, OAuthError, PlanError};

/// Prompts longer than this are rejected; the plan is appended on top.
const MAX_PROMPT_CHARS: usize = 32_000;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub config: MasterConfig,
    pub db: DbHandle,
    pub signer: TokenSigner,
    pub gate: TaskGate,
    pub supervisor: Supervisor,
    pub plans: PlanLinker,
    pub oauth: OAuthBroker,
    /// Failed logins, keyed by client IP and by email.
    pub login_limiter: AttemptLimiter,
    /// Failed step-up passwords, keyed by operator.
    pub step_up_limiter: AttemptLimiter,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: MasterConfig, db: DbHandle) -> anyhow::Result<Self> {
        let secret = match config.auth.token_secret.as_deref() {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!("no token secret configured; using an ephemeral one");
                super::oauth::random_urlsafe(48).into_bytes()
            }
        };
        Ok(Self {
            signer: TokenSigner::new(&secret),
            gate: TaskGate::new(),
            supervisor: Supervisor::new(&config.runner, db.clone()),
            plans: PlanLinker::new(&config.plans),
            oauth: OAuthBroker::new(config.oauth.clone())?,
            login_limiter: AttemptLimiter::from_config(&config.auth),
            step_up_limiter: AttemptLimiter::from_config(&config.auth),
            config,
            db,
        })
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub prompt: String,
    pub repo: Option<String>,
    pub model: Option<String>,
    #[serde(alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    pub account: Option<String>,
    #[serde(alias = "planPath")]
    pub plan_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreatePlanRequest {
    pub repo: Option<String>,
    #[serde(default)]
    pub title: String,
    pub summary: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LinkPlanRequest {
    pub repo: Option<String>,
    #[serde(default, alias = "planPath")]
    pub plan_path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RepoQuery {
    pub repo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountRequest {
    pub account: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub code: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    InvalidRepo(String),
    InvalidPlanPath(String),
    EmptyCode,
    RequiresPlan(String),
    AlreadyRunning { task_id: String },
    NotFound(String),
    NoSession,
    ExchangeFailed(String),
    Unauthorized(String),
    InvalidCredentials,
    Forbidden(String),
    StepUpRequired,
    RateLimited { retry_after_secs: u64 },
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_)
            | ApiError::InvalidRepo(_)
            | ApiError::InvalidPlanPath(_)
            | ApiError::EmptyCode => StatusCode::BAD_REQUEST,
            ApiError::RequiresPlan(_) => StatusCode::PRECONDITION_REQUIRED,
            ApiError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            ApiError::NotFound(_) | ApiError::NoSession => StatusCode::NOT_FOUND,
            ApiError::ExchangeFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unauthorized(_) | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::StepUpRequired => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid-request",
            ApiError::InvalidRepo(_) => "invalid-repo",
            ApiError::InvalidPlanPath(_) => "invalid-plan-path",
            ApiError::EmptyCode => "empty-code",
            ApiError::RequiresPlan(_) => "requires-plan",
            ApiError::AlreadyRunning { .. } => "already-running",
            ApiError::NotFound(_) => "not-found",
            ApiError::NoSession => "no-session",
            ApiError::ExchangeFailed(_) => "exchange-failed",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::InvalidCredentials => "invalid-credentials",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::StepUpRequired => "step-up-required",
            ApiError::RateLimited { .. } => "rate-limited",
            ApiError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(msg)
            | ApiError::InvalidRepo(msg)
            | ApiError::InvalidPlanPath(msg)
            | ApiError::RequiresPlan(msg)
            | ApiError::NotFound(msg)
            | ApiError::ExchangeFailed(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Internal(msg) => msg.clone(),
            ApiError::EmptyCode => "Authorization code is empty".to_string(),
            ApiError::AlreadyRunning { task_id } => {
                format!("A task is already running: {}", task_id)
            }
            ApiError::NoSession => {
                "No OAuth session in progress; start a new login first".to_string()
            }
            ApiError::InvalidCredentials => "Invalid credentials".to_string(),
            ApiError::StepUpRequired => {
                "Step-up authentication required; re-enter your password".to_string()
            }
            ApiError::RateLimited { retry_after_secs } => format!(
                "Too many failed attempts; try again in {} seconds",
                retry_after_secs
            ),
        }
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        ApiError::RateLimited {
            retry_after_secs: retry_after.as_secs().max(1),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({"error": self.message(), "code": self.code()});
        if let ApiError::AlreadyRunning { task_id } = &self {
            body["taskId"] = json!(task_id);
        }
        let mut response = (self.status(), Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", e), "internal error");
        ApiError::Internal(format!("{:#}", e))
    }
}

impl From<PlanError> for ApiError {
    fn from(e: PlanError) -> Self {
        if e.requires_plan() {
            return ApiError::RequiresPlan(e.to_string());
        }
        match &e {
            PlanError::EmptyTitle => ApiError::InvalidRequest(e.to_string()),
            PlanError::Io { .. } => {
                tracing::error!(error = %e, "plan file access failed");
                ApiError::Internal(e.to_string())
            }
            _ => ApiError::InvalidPlanPath(e.to_string()),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::AlreadyRunning { task_id } => ApiError::AlreadyRunning { task_id },
            e @ GateError::NotFound { .. } => ApiError::NotFound(e.to_string()),
        }
    }
}

impl From<OAuthError> for ApiError {
    fn from(e: OAuthError) -> Self {
        match &e {
            OAuthError::EmptyCode => ApiError::EmptyCode,
            OAuthError::NoSession => ApiError::NoSession,
            OAuthError::InvalidAccount(_) => ApiError::InvalidRequest(e.to_string()),
            OAuthError::Exchange { .. }
            | OAuthError::Transport(_)
            | OAuthError::InvalidResponse(_) => ApiError::ExchangeFailed(e.to_string()),
            OAuthError::InvalidEndpoint { .. }
            | OAuthError::Background(_)
            | OAuthError::Credentials(_) => {
                tracing::error!(error = %e, "OAuth failure");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<CredentialsError> for ApiError {
    fn from(e: CredentialsError) -> Self {
        tracing::error!(error = %e, "credential file failure");
        ApiError::Internal(e.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

/// All routes. The `/master` group is wrapped in session auth and, outside
/// that, the audit recorder, so rejected calls are audited too.
pub fn api_router(state: &SharedState) -> Router<SharedState> {
    let master = Router::new()
        .route("/step-up", post(step_up::elevate))
        .route("/plans", get(list_plans).post(create_plan))
        .route("/plans/link", post(link_plan))
        .route("/claude-run", get(current_run).post(start_run))
        .route("/claude-run/{task_id}", delete(cancel_run))
        .route("/tasks", get(list_tasks))
        .route("/claude-oauth/start", post(oauth_start))
        .route("/claude-oauth/complete", post(oauth_complete))
        .route("/claude-oauth/status", get(oauth_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), audit::record));

    Router::new()
        .route("/health", get(health_check))
        .route("/auth/login", post(auth::login))
        .nest("/master", master)
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Parse a JSON body; an empty body yields the type's default.
pub fn parse_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid JSON body: {}", e)))
}

fn with_meta(response: impl IntoResponse, meta: Value) -> Response {
    let mut response = response.into_response();
    response.extensions_mut().insert(AuditMeta(meta));
    response
}

/// Attach audit details to either outcome. `meta` describes the request;
/// keys a successful handler attached itself take precedence, and errors
/// add their code.
fn audited(result: Result<Response, ApiError>, mut meta: Value) -> Response {
    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            meta["error"] = json!(e.code());
            if let ApiError::AlreadyRunning { task_id } = &e {
                meta["active_task_id"] = json!(task_id);
            }
            e.into_response()
        }
    };
    if let Some(AuditMeta(Value::Object(own))) = response.extensions_mut().remove::<AuditMeta>()
        && let Value::Object(meta) = &mut meta
    {
        meta.extend(own);
    }
    response.extensions_mut().insert(AuditMeta(meta));
    response
}

fn resolve_repo(state: &AppState, repo: Option<&str>) -> Result<(String, PathBuf), ApiError> {
    state.config.resolve_repo(repo).ok_or_else(|| {
        ApiError::InvalidRepo(match repo.map(str::trim).filter(|r| !r.is_empty()) {
            Some(name) => format!("Unknown repo: {}", name),
            None => "No repo given and no default repo configured".to_string(),
        })
    })
}

/// The plan a run needs: named, linked to `repo`, and present on disk.
async fn require_linked_plan(
    state: &AppState,
    repo: &str,
    repo_path: &FsPath,
    plan_path: Option<&str>,
) -> Result<PlanDocument, ApiError> {
    let raw = plan_path
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or(PlanError::Missing)?;
    let plan_path = validate_plan_path(raw)?;

    let linked = {
        let (repo, plan_path) = (repo.to_string(), plan_path.clone());
        state
            .db
            .call(move |db| db.get_plan_link(&repo, &plan_path))
            .await?
    };
    if linked.is_none() {
        return Err(PlanError::NotLinked {
            repo: repo.to_string(),
            path: plan_path,
        }
        .into());
    }
    Ok(state.plans.load(repo_path, &plan_path).await?)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_plans(
    State(state): State<SharedState>,
    Query(query): Query<RepoQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let repo = query.repo.filter(|r| !r.trim().is_empty());
    let links = state
        .db
        .call(move |db| db.list_plan_links(repo.as_deref()))
        .await?;
    Ok(Json(links))
}

async fn create_plan(State(state): State<SharedState>, body: Bytes) -> Response {
    let req = parse_json::<CreatePlanRequest>(&body);
    let meta = match &req {
        Ok(r) => json!({"repo": r.repo, "title": r.title}),
        Err(_) => json!({}),
    };
    let result = match req {
        Ok(req) => create_linked_plan(&state, req).await,
        Err(e) => Err(e),
    };
    audited(result, meta)
}

async fn create_linked_plan(state: &AppState, req: CreatePlanRequest) -> Result<Response, ApiError> {
    let (repo, repo_path) = resolve_repo(state, req.repo.as_deref())?;

    let created = state
        .plans
        .create(&repo_path, &repo, &req.title, req.summary.as_deref())
        .await?;
    let link = {
        let (repo, path, title) = (
            repo.clone(),
            created.plan_path.clone(),
            req.title.trim().to_string(),
        );
        state
            .db
            .call(move |db| db.link_plan(&repo, &path, Some(&title)))
            .await?
    };

    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(with_meta(
        (status, Json(json!({"plan": link, "created": created.created}))),
        json!({"repo": repo, "plan_path": created.plan_path, "created": created.created}),
    ))
}

async fn link_plan(State(state): State<SharedState>, body: Bytes) -> Response {
    let req = parse_json::<LinkPlanRequest>(&body);
    let meta = match &req {
        Ok(r) => json!({"repo": r.repo, "plan_path": r.plan_path}),
        Err(_) => json!({}),
    };
    let result = match req {
        Ok(req) => link_existing_plan(&state, req).await,
        Err(e) => Err(e),
    };
    audited(result, meta)
}

async fn link_existing_plan(state: &AppState, req: LinkPlanRequest) -> Result<Response, ApiError> {
    let (repo, repo_path) = resolve_repo(state, req.repo.as_deref())?;

    let plan_path = validate_plan_path(&req.plan_path)?;
    let doc = state.plans.load(&repo_path, &plan_path).await?;
    let link = {
        let (repo, path) = (repo.clone(), plan_path.clone());
        state
            .db
            .call(move |db| db.link_plan(&repo, &path, None))
            .await?
    };

    Ok(with_meta(
        Json(json!({
            "plan": link,
            "size_bytes": doc.size_bytes,
            "truncated": doc.truncated,
        })),
        json!({"repo": repo, "plan_path": plan_path}),
    ))
}

/// `POST /master/claude-run`
///
/// Streams the run as SSE. The slot is taken before the linked plan is
/// checked, so while a request that ends in `428 requires-plan` is being
/// validated, a concurrent start gets `409 already-running` naming a task
/// that never runs.
async fn start_run(
    State(state): State<SharedState>,
    user: AuthUser,
    elevated: Result<StepUp, ApiError>,
    body: Bytes,
) -> Response {
    let req = parse_json::<RunRequest>(&body);
    let meta = match &req {
        Ok(r) => json!({
            "repo": r.repo,
            "model": r.model,
            "plan_path": r.plan_path,
            "account": r.account,
            "prompt_preview": preview(r.prompt.trim(), 200),
        }),
        Err(_) => json!({}),
    };
    let result = match (elevated, req) {
        (Err(e), _) | (_, Err(e)) => Err(e),
        (Ok(_), Ok(req)) => begin_run(&state, &user, req).await,
    };
    audited(result, meta)
}

async fn begin_run(state: &AppState, user: &AuthUser, req: RunRequest) -> Result<Response, ApiError> {
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::InvalidRequest("prompt is required".into()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::InvalidRequest(format!(
            "prompt exceeds {} characters",
            MAX_PROMPT_CHARS
        )));
    }
    let (repo, repo_path) = resolve_repo(state, req.repo.as_deref())?;
    let model = match req.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => m.parse::<ModelId>().map_err(ApiError::InvalidRequest)?,
        None => ModelId::default(),
    };
    let account_dir = resolve_account_dir(&state.config.runner, req.account.as_deref())?;

    let mut spec = TaskSpec {
        id: uuid::Uuid::new_v4().to_string(),
        repo,
        repo_path,
        model,
        prompt: prompt.to_string(),
        plan_path: req.plan_path.clone().unwrap_or_default(),
        timeout_ms: state.config.runner.clamp_timeout(req.timeout_ms),
    };

    let lease = state.gate.try_acquire(&spec)?;

    let plan =
        require_linked_plan(state, &spec.repo, &spec.repo_path, req.plan_path.as_deref()).await?;
    spec.plan_path = plan.repo_relative_path.clone();
    spec.prompt = agent_prompt(prompt, &plan);

    let env = AgentEnv::resolve(&state.config.runner, &account_dir).await;

    {
        let spec = spec.clone();
        let user_id = user.id;
        state
            .db
            .call(move |db| db.insert_task(&spec, Some(user_id)))
            .await?;
    }

    let meta = json!({
        "task_id": spec.id,
        "repo": spec.repo,
        "model": spec.model.as_str(),
        "plan_path": spec.plan_path,
        "prompt_preview": preview(prompt, 200),
        "account_dir": account_dir.display().to_string(),
        "timeout_ms": spec.timeout_ms,
    });
    let task_id = spec.id.clone();
    let guard = lease.cancel_token().drop_guard();
    let rx = state.supervisor.launch(spec, env, lease);
    let keep_alive = Duration::from_secs(state.config.runner.keep_alive_secs.max(1));

    Ok(with_meta(
        relay::sse_response(rx, guard, &task_id, keep_alive),
        meta,
    ))
}

async fn cancel_run(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(task_id): Path<String>,
) -> Response {
    let meta = json!({"task_id": task_id});
    let result = state.gate.cancel(&task_id).map_err(ApiError::from).map(|()| {
        tracing::info!(task_id = %task_id, user_id = user.id, "task cancel requested");
        Json(json!({"ok": true, "taskId": task_id})).into_response()
    });
    audited(result, meta)
}

async fn current_run(State(state): State<SharedState>) -> impl IntoResponse {
    let task = state.gate.current();
    Json(json!({"running": task.is_some(), "task": task}))
}

async fn list_tasks(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let tasks = state.db.call(move |db| db.list_tasks(limit)).await?;
    Ok(Json(tasks))
}

async fn oauth_start(
    State(state): State<SharedState>,
    _user: AuthUser,
    elevated: Result<StepUp, ApiError>,
    body: Bytes,
) -> Response {
    let req = parse_json::<AccountRequest>(&body);
    let meta = match &req {
        Ok(r) => json!({"account": r.account}),
        Err(_) => json!({}),
    };
    let result = match (elevated, req) {
        (Err(e), _) | (_, Err(e)) => Err(e),
        (Ok(_), Ok(req)) => begin_oauth(&state, req),
    };
    audited(result, meta)
}

fn begin_oauth(state: &AppState, req: AccountRequest) -> Result<Response, ApiError> {
    let account_dir = resolve_account_dir(&state.config.runner, req.account.as_deref())?;
    let start = state.oauth.start(account_dir)?;
    let meta = json!({"account_dir": start.account_dir});
    Ok(with_meta(Json(start), meta))
}

async fn oauth_complete(
    State(state): State<SharedState>,
    _user: AuthUser,
    elevated: Result<StepUp, ApiError>,
    body: Bytes,
) -> Response {
    let meta = json!({"account_dir": state.oauth.pending_account()});
    let result = match (elevated, parse_json::<CompleteRequest>(&body)) {
        (Err(e), _) | (_, Err(e)) => Err(e),
        (Ok(_), Ok(req)) => finish_oauth(&state, req).await,
    };
    audited(result, meta)
}

async fn finish_oauth(state: &AppState, req: CompleteRequest) -> Result<Response, ApiError> {
    let done = state.oauth.complete(&req.code).await?;
    let meta = json!({"account_dir": done.account_dir});
    Ok(with_meta(
        Json(json!({
            "ok": true,
            "message": "Agent credentials saved",
            "account_dir": done.account_dir,
            "expires_at": done.expires_at,
            "email": done.email,
        })),
        meta,
    ))
}

async fn oauth_status(
    State(state): State<SharedState>,
    Query(query): Query<AccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_dir = resolve_account_dir(&state.config.runner, query.account.as_deref())?;
    let status = credential_status(&account_dir, chrono::Utc::now().timestamp_millis()).await?;
    Ok(Json(status))
}
