//! HTTP surface of the adapter.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/auth/login` | | Form login, returns a bearer token |
//! | `GET`  | `/status` | ✓ | Engine status report |
//! | `POST` | `/sync` | ✓ | Validate and dispatch a table sync |
//! | `POST` | `/internal/dev-token` | | Admin token without credentials (dev only) |
//! | `POST` | `/qa/run-tests?mode=` | ✓ | Run the test suite, buffered |
//! | `POST` | `/qa/run-tests/stream?mode=` | ✓ | Run the test suite, streamed as text |
//! | `GET`  | `/qa/coverage/summary` | ✓ | Line coverage from `coverage.xml` |
//! | `POST` | `/qa/coverage/refresh` | ✓ | Re-check the HTML coverage report |
//! | `GET`  | `/htmlcov/*` | | HTML coverage report, served from disk |
//! | `GET`  | `/health` | | Liveness and version |
//! | `GET`  | `/docs` | | Route index |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Invalid table names: [\"a b\"]" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `unprocessable_entity` (422), `rate_limited` (429), `sync_engine_error`
//! (500), `test_runner_error` (500).
//!
//! # Authentication
//!
//! Protected routes sit behind [`require_auth`], which checks the bearer
//! token and stores the caller as a [`Principal`] request extension.

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::FormRejection, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Form, Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth::TokenService;
use crate::config::Config;
use crate::coverage::{self, HTML_MOUNT};
use crate::engine::{load_blocking, run_blocking, EngineLoader, ScriptEngineLoader};
use crate::qa::{self, TestMode};
use crate::ratelimit::{RateLimiter, RateSpec};
use crate::sync::{dispatch_sync, DispatchError, SyncRequest};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    tokens: Arc<TokenService>,
    engines: Arc<dyn EngineLoader>,
    login_limiter: Option<Arc<RateLimiter>>,
    sync_limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    pub fn new(config: Config, engines: Arc<dyn EngineLoader>) -> anyhow::Result<Self> {
        let limiter = |spec: &Option<String>| -> anyhow::Result<Option<Arc<RateLimiter>>> {
            spec.as_deref()
                .map(|s| RateSpec::parse(s).map(|spec| Arc::new(RateLimiter::new(spec))))
                .transpose()
        };
        Ok(Self {
            tokens: Arc::new(TokenService::new(&config.auth)),
            login_limiter: limiter(&config.rate_limit.login).context("invalid rate_limit.login")?,
            sync_limiter: limiter(&config.rate_limit.sync).context("invalid rate_limit.sync")?,
            config: Arc::new(config),
            engines,
        })
    }
}

/// The authenticated caller, inserted by [`require_auth`].
#[derive(Debug, Clone)]
pub struct Principal(pub String);

/// Starts the server with the Lua engine loader from `[engine]`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let loader = Arc::new(ScriptEngineLoader::new(&config.engine));
    run_server_with_loader(config, loader).await
}

/// Starts the server with a caller-supplied engine loader.
///
/// Runs until Ctrl-C. Client addresses are tracked for rate limiting.
pub async fn run_server_with_loader(
    config: &Config,
    engines: Arc<dyn EngineLoader>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState::new(config.clone(), engines)?;
    let app = build_router(state)?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        engine_home = %config.engine.home.display(),
        dev_token = config.auth.enable_dev_token,
        "DataSync QA adapter listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Assemble every route, middleware and layer.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let mut login = Router::new().route("/auth/login", post(handle_login));
    if let Some(limiter) = &state.login_limiter {
        login = login.route_layer(middleware::from_fn_with_state(
            limiter.clone(),
            enforce_rate_limit,
        ));
    }

    let mut sync = Router::new().route("/sync", post(handle_sync));
    if let Some(limiter) = &state.sync_limiter {
        sync = sync.route_layer(middleware::from_fn_with_state(
            limiter.clone(),
            enforce_rate_limit,
        ));
    }

    let protected = Router::new()
        .route("/status", get(handle_status))
        .route("/qa/run-tests", post(handle_run_tests))
        .route("/qa/run-tests/stream", post(handle_run_tests_stream))
        .route("/qa/coverage/summary", get(handle_coverage_summary))
        .route("/qa/coverage/refresh", post(handle_coverage_refresh))
        .merge(sync)
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let mut public = Router::new()
        .route("/", get(handle_root))
        .route("/favicon.ico", get(handle_favicon))
        .route("/health", get(handle_health))
        .route("/docs", get(handle_docs))
        .merge(login);

    if state.config.auth.enable_dev_token {
        tracing::warn!("dev-token route enabled: POST /internal/dev-token issues admin tokens without credentials");
        public = public.route("/internal/dev-token", post(handle_dev_token));
    }

    let cors = cors_layer(&state.config.server.cors_origins)?;
    let coverage_dir = ServeDir::new(state.config.qa.coverage_html_path());

    Ok(Router::new()
        .merge(public)
        .merge(protected)
        .nest_service(HTML_MOUNT, coverage_dir)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return Ok(layer.allow_origin(Any));
    }
    let values = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).with_context(|| format!("invalid CORS origin: {}", o))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(values)))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into the JSON error contract.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::FORBIDDEN, "forbidden", message)
}

fn unprocessable(message: impl Into<String>) -> AppError {
    AppError::new(
        StatusCode::UNPROCESSABLE_ENTITY,
        "unprocessable_entity",
        message,
    )
}

fn engine_error(err: impl std::fmt::Display) -> AppError {
    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "sync_engine_error",
        err.to_string(),
    )
}

fn runner_error(err: anyhow::Error) -> AppError {
    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "test_runner_error",
        format!("{:#}", err),
    )
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::EmptyTableList | DispatchError::InvalidTableNames(_) => {
                bad_request(err.to_string())
            }
            DispatchError::TableNotWhitelisted(_) => forbidden(err.to_string()),
            DispatchError::Engine(_) => engine_error(err),
        }
    }
}

/// Decode an optional JSON body. An empty body yields `T::default()`;
/// syntax errors are 400, well-formed JSON of the wrong shape is 422.
fn parse_json_body<T>(body: &[u8]) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| match e.classify() {
        serde_json::error::Category::Data => unprocessable(format!("invalid request body: {}", e)),
        _ => bad_request(format!("malformed JSON body: {}", e)),
    })
}

// ============ Middleware ============

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

/// Reject requests without a valid bearer token.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())
        .map(str::to_string)
        .ok_or_else(|| unauthorized("Not authenticated"))?;
    let username = state
        .tokens
        .verify_token(&token)
        .map_err(|e| unauthorized(e.to_string()))?;
    request.extensions_mut().insert(Principal(username));
    Ok(next.run(request).await)
}

async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = request
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if let Err(retry_after) = limiter.check(client) {
        tracing::warn!(client = %client, path = %request.uri().path(), "rate limit exceeded");
        let spec = limiter.spec();
        let mut response = AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            format!(
                "Rate limit exceeded: {} per {} seconds",
                spec.limit,
                spec.window.as_secs()
            ),
        )
        .into_response();
        let secs = retry_after.as_secs().max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return Ok(response);
    }
    Ok(next.run(request).await)
}

// ============ Public routes ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_root() -> Redirect {
    Redirect::temporary("/docs")
}

async fn handle_favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct RouteInfo {
    method: &'static str,
    path: &'static str,
    auth: bool,
    description: &'static str,
}

const ROUTES: &[(&str, &str, bool, &str)] = &[
    ("POST", "/auth/login", false, "Form login (username, password), returns a bearer token"),
    ("GET", "/status", true, "Sync engine status"),
    ("POST", "/sync", true, "Sync tables: {\"tables\": [..] | null, \"dry_run\": bool}"),
    ("POST", "/qa/run-tests", true, "Run tests (mode=auto|ai|pytest), buffered"),
    ("POST", "/qa/run-tests/stream", true, "Run tests (mode=auto|ai|pytest), streamed"),
    ("GET", "/qa/coverage/summary", true, "Line coverage percentage"),
    ("POST", "/qa/coverage/refresh", true, "Re-check the HTML coverage report"),
    ("GET", "/htmlcov/index.html", false, "HTML coverage report"),
    ("GET", "/health", false, "Health check"),
    ("POST", "/internal/dev-token", false, "Admin token without credentials (development only)"),
];

async fn handle_docs(State(state): State<AppState>) -> Json<serde_json::Value> {
    let dev_token = state.config.auth.enable_dev_token;
    let routes: Vec<RouteInfo> = ROUTES
        .iter()
        .filter(|(_, path, _, _)| dev_token || *path != "/internal/dev-token")
        .map(|&(method, path, auth, description)| RouteInfo {
            method,
            path,
            auth,
            description,
        })
        .collect();
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
    }))
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
}

impl TokenResponse {
    fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer",
        }
    }
}

async fn handle_login(
    State(state): State<AppState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Json<TokenResponse>, AppError> {
    let Form(form) = form.map_err(|e| unprocessable(e.body_text()))?;

    if !state.tokens.authenticate(&form.username, &form.password) {
        tracing::warn!(username = %form.username, "login failed");
        return Err(unauthorized("Invalid credentials"));
    }

    let token = state
        .tokens
        .issue_token(&form.username)
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;
    tracing::info!(username = %form.username, "login succeeded");
    Ok(Json(TokenResponse::bearer(token)))
}

async fn handle_dev_token(State(state): State<AppState>) -> Result<Json<TokenResponse>, AppError> {
    let username = state.tokens.admin_username().to_string();
    let token = state
        .tokens
        .issue_token(&username)
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;
    tracing::warn!(username = %username, "issued dev token");
    Ok(Json(TokenResponse::bearer(token)))
}

// ============ Engine routes ============

async fn handle_status(
    State(state): State<AppState>,
) -> Result<Json<crate::engine::StatusReport>, AppError> {
    let engine = load_blocking(state.engines.clone())
        .await
        .map_err(|e| engine_error(format!("{:#}", e)))?;
    let report = run_blocking(engine, |e| e.sync_status())
        .await
        .map_err(|e| engine_error(format!("{:#}", e)))?;
    Ok(Json(report))
}

async fn handle_sync(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Json<crate::sync::SyncResult>, AppError> {
    let request: SyncRequest = parse_json_body(&body)?;
    tracing::info!(user = %principal.0, tables = ?request.tables, dry_run = request.dry_run, "sync requested");

    let result = dispatch_sync(
        request,
        &state.config.engine.allowed_tables,
        state.engines.clone(),
    )
    .await
    .map_err(|e| {
        if let DispatchError::Engine(err) = &e {
            tracing::error!(error = %format!("{:#}", err), "sync failed");
        }
        AppError::from(e)
    })?;
    Ok(Json(result))
}

// ============ QA routes ============

#[derive(Debug, Deserialize)]
struct ModeQuery {
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RunTestsBody {
    #[serde(default)]
    with_ai: Option<bool>,
}

fn resolve_mode(query: &ModeQuery, body: &[u8]) -> Result<TestMode, AppError> {
    let mode = match query.mode.as_deref() {
        Some(raw) => raw
            .parse::<TestMode>()
            .map_err(|e| unprocessable(e.to_string()))?,
        None => TestMode::default(),
    };
    let body: RunTestsBody = parse_json_body(body)?;
    Ok(mode.with_override(body.with_ai))
}

async fn handle_run_tests(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ModeQuery>,
    body: Bytes,
) -> Result<Json<qa::RunReport>, AppError> {
    let mode = resolve_mode(&query, &body)?;
    tracing::info!(user = %principal.0, mode = ?mode, "test run requested");
    let report = qa::run_buffered(mode, &state.config.qa)
        .await
        .map_err(runner_error)?;
    Ok(Json(report))
}

async fn handle_run_tests_stream(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ModeQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let mode = resolve_mode(&query, &body)?;
    tracing::info!(user = %principal.0, mode = ?mode, "streamed test run requested");
    let (stream, _exit) = qa::run_streamed(mode, state.config.qa.clone()).map_err(runner_error)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn handle_coverage_summary(State(state): State<AppState>) -> Json<coverage::CoverageSummary> {
    Json(coverage::summarize(&state.config.qa))
}

async fn handle_coverage_refresh(State(state): State<AppState>) -> Json<coverage::PublishReport> {
    Json(coverage::publish_html(&state.config.qa))
}
