//! HTTP route handlers for the StatusHub server.
//!
//! This module provides the browser pages, the JSON API and the streaming
//! endpoints:
//!
//! - `GET /`, `GET|POST /login`, `GET /logout` - Dashboard and login flow
//! - `GET /assets/*` - Static files
//! - `GET /health` - Health check endpoint
//! - `POST /api/*` - Log, media and settings API (session required)
//! - `GET /api/serviceStream`, `GET /api/fullStream` - WebSocket tails
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Process configuration
//! - Durable settings and the event store they govern
//! - The session authority and login rate limiter
//! - A shutdown token that cancels every live stream
//!
//! # Example
//!
//! ```rust,no_run
//! use statushub_server::config::ServerConfig;
//! use statushub_server::routes::{create_router, AppState};
//! use statushub_server::settings::{MemorySettingsStore, Settings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = Settings::create(MemorySettingsStore::new(), "password").unwrap();
//!     let state = AppState::new(ServerConfig::default(), settings);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, DefaultBodyLimit, FromRequestParts, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{authenticate, client_identity, logout_cookie, session_cookie};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::session::SessionAuthority;
use crate::settings::Settings;
use crate::store::EventStore;
use crate::stream::{run_stream, Incoming, StreamError, StreamTransport};
use crate::types::{LogRecord, MediaRecord, Scope};

// ============================================================================
// Constants
// ============================================================================

/// Maximum request body size; media uploads arrive base64 encoded.
const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

/// Dashboard page inside the assets directory.
const INDEX_PAGE: &str = "index.html";

/// Login page inside the assets directory.
const LOGIN_PAGE: &str = "login.html";

/// Content type used when a media record's MIME type is not a valid header.
const FALLBACK_MIME: &str = "application/octet-stream";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Process configuration.
    pub config: Arc<ServerConfig>,

    /// Durable settings.
    pub settings: Arc<Settings>,

    /// Log and media records, limited by `settings`.
    pub store: Arc<EventStore>,

    /// Issues and verifies session cookies.
    pub sessions: Arc<SessionAuthority>,

    /// Limits failed logins per client.
    pub login_limiter: RateLimiter,

    /// Cancelled on shutdown; every stream listens on a child token.
    pub shutdown: CancellationToken,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state with a default login limiter.
    #[must_use]
    pub fn new(config: ServerConfig, settings: Settings) -> Self {
        Self::with_components(config, Arc::new(settings), RateLimiter::default())
    }

    /// Creates application state with shared settings and a custom limiter.
    ///
    /// Useful for testing or when custom login limits are needed.
    #[must_use]
    pub fn with_components(
        config: ServerConfig,
        settings: Arc<Settings>,
        login_limiter: RateLimiter,
    ) -> Self {
        let sessions = SessionAuthority::new(config.session_secret.clone());
        Self {
            config: Arc::new(config),
            store: Arc::new(EventStore::new(settings.clone())),
            settings,
            sessions: Arc::new(sessions),
            login_limiter,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("login_limiter", &self.login_limiter)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let assets = ServeDir::new(&state.config.assets_dir);

    Router::new()
        .route("/", get(get_index))
        .route("/login", get(get_login).post(post_login))
        .route("/logout", get(get_logout))
        .route("/api/add", post(api_add))
        .route("/api/addBatch", post(api_add_batch))
        .route("/api/addMedia", post(api_add_media))
        .route("/api/overview", post(api_overview))
        .route("/api/mediaOverview", post(api_media_overview))
        .route("/api/fullLog", post(api_full_log))
        .route("/api/serviceLog", post(api_service_log))
        .route("/api/mediaLog", post(api_media_log))
        .route("/api/mediaView", get(api_media_view))
        .route("/api/delete", post(api_delete))
        .route("/api/deleteMedia", post(api_delete_media))
        .route("/api/getprefs", post(api_get_prefs))
        .route("/api/setprefs", post(api_set_prefs))
        .route("/api/chpass", post(api_change_password))
        .route("/api/serviceStream", get(api_service_stream))
        .route("/api/fullStream", get(api_full_stream))
        .layer(middleware::map_response(disable_cache))
        .route("/health", get(get_health))
        .nest_service("/assets", assets)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn disable_cache(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

// ============================================================================
// Responses and Extractors
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// JSON success envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiData<T> {
    pub data: T,
}

type ApiResult<T> = Result<Json<ApiData<T>>, ServerError>;

fn data<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiData { data }))
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Persistence(_) | Self::Transport(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if self.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        } else {
            debug!(error = %self, code = self.code(), "Request rejected");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimit { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

/// Proof that the request carried a valid session cookie.
#[derive(Debug, Clone, Copy)]
pub struct Authenticated;

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(&parts.headers, &state.sessions).map_err(|err| {
            debug!(path = %parts.uri.path(), reason = %err, "Unauthenticated request");
            ServerError::Unauthenticated
        })?;
        Ok(Self)
    }
}

/// Address of the directly connected peer, when the server was started
/// with connection info.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self(addr))
    }
}

/// Parses a JSON request body regardless of its declared content type.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ServerError> {
    serde_json::from_slice(body)
        .map_err(|err| ServerError::validation(format!("invalid request body: {err}")))
}

// ============================================================================
// Pages
// ============================================================================

async fn serve_page(state: &AppState, page: &str, request: Request) -> Response {
    let path = state.config.assets_dir.join(page);
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

/// GET / - Dashboard, or a redirect to the login page.
async fn get_index(State(state): State<AppState>, request: Request) -> Response {
    if authenticate(request.headers(), &state.sessions).is_err() {
        return Redirect::to("/login").into_response();
    }
    serve_page(&state, INDEX_PAGE, request).await
}

/// GET /login - Login page.
async fn get_login(State(state): State<AppState>, request: Request) -> Response {
    serve_page(&state, LOGIN_PAGE, request).await
}

/// Login form body.
#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    password: String,
}

/// POST /login - Check the password and start a session.
///
/// # Responses
///
/// - `303 See Other` to `/` with a session cookie on success
/// - `303 See Other` to `/login?status=failure` on a wrong password
/// - `429 Too Many Requests` once the client's attempts are exhausted
async fn post_login(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Result<Response, ServerError> {
    let identity = client_identity(&headers, peer, state.config.reverse_proxies);

    if let RateLimitResult::Limited { retry_after_secs } =
        state.login_limiter.check(&identity).await
    {
        warn!(client = %identity, retry_after_secs, "Login rate limit exceeded");
        return Err(ServerError::rate_limit(identity, retry_after_secs));
    }

    if !state.settings.check_password(&form.password) {
        state.login_limiter.reject(&identity).await;
        warn!(client = %identity, "Failed login attempt");
        return Ok(Redirect::to("/login?status=failure").into_response());
    }

    info!(client = %identity, "Login succeeded");
    let token = state.sessions.issue_token();
    let cookie = session_cookie(&token, &state.sessions);
    Ok(([(header::SET_COOKIE, cookie)], Redirect::to("/")).into_response())
}

/// GET /logout - Clear the session cookie.
async fn get_logout() -> Response {
    ([(header::SET_COOKIE, logout_cookie())], Redirect::to("/")).into_response()
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of services with log records.
    pub services: usize,

    /// Number of live streams.
    pub streams: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        services: state.store.service_count(),
        streams: state.store.listener_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Log API
// ============================================================================

#[derive(Debug, Deserialize)]
struct AddRequest {
    service: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddBatchRequest {
    service: String,
    messages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceRequest {
    service: String,
}

/// POST /api/add - Append one message; responds with its id.
async fn api_add(_: Authenticated, State(state): State<AppState>, body: Bytes) -> ApiResult<u64> {
    let request: AddRequest = parse_body(&body)?;
    data(state.store.add(&request.service, &request.message))
}

/// POST /api/addBatch - Append several messages; responds with their ids.
async fn api_add_batch(
    _: Authenticated,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Vec<u64>> {
    let request: AddBatchRequest = parse_body(&body)?;
    data(state.store.add_batch(&request.service, &request.messages))
}

async fn api_overview(_: Authenticated, State(state): State<AppState>) -> ApiResult<Vec<LogRecord>> {
    data(state.store.overview())
}

async fn api_full_log(_: Authenticated, State(state): State<AppState>) -> ApiResult<Vec<LogRecord>> {
    data(state.store.full_log())
}

async fn api_service_log(
    _: Authenticated,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Vec<LogRecord>> {
    let request: ServiceRequest = parse_body(&body)?;
    data(state.store.service_log(&request.service)?)
}

async fn api_delete(_: Authenticated, State(state): State<AppState>, body: Bytes) -> ApiResult<bool> {
    let request: ServiceRequest = parse_body(&body)?;
    state.store.delete_service(&request.service)?;
    info!(service = %request.service, "Deleted service");
    data(true)
}

// ============================================================================
// Media API
// ============================================================================

#[derive(Debug, Deserialize)]
struct AddMediaRequest {
    folder: String,
    filename: String,
    mime: String,
    data: String,
    #[serde(default)]
    replace: bool,
}

#[derive(Debug, Deserialize)]
struct FolderRequest {
    folder: String,
}

#[derive(Debug, Deserialize)]
struct MediaViewQuery {
    id: Option<String>,
}

/// POST /api/addMedia - Store a base64 encoded blob; responds with its id.
async fn api_add_media(
    _: Authenticated,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<u64> {
    let request: AddMediaRequest = parse_body(&body)?;
    let bytes = BASE64_STANDARD
        .decode(request.data.as_bytes())
        .map_err(|err| ServerError::validation(format!("invalid media data: {err}")))?;

    let id = state.store.add_media(
        &request.folder,
        &request.filename,
        &request.mime,
        bytes,
        request.replace,
    );
    debug!(folder = %request.folder, filename = %request.filename, id, "Stored media");
    data(id)
}

async fn api_media_overview(
    _: Authenticated,
    State(state): State<AppState>,
) -> ApiResult<Vec<MediaRecord>> {
    data(state.store.media_overview())
}

async fn api_media_log(
    _: Authenticated,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Vec<MediaRecord>> {
    let request: FolderRequest = parse_body(&body)?;
    data(state.store.media_log(&request.folder)?)
}

async fn api_delete_media(
    _: Authenticated,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<bool> {
    let request: FolderRequest = parse_body(&body)?;
    state.store.delete_media(&request.folder)?;
    info!(folder = %request.folder, "Deleted media folder");
    data(true)
}

/// GET /api/mediaView?id= - Raw media bytes for inline display.
async fn api_media_view(
    _: Authenticated,
    State(state): State<AppState>,
    Query(query): Query<MediaViewQuery>,
) -> Result<Response, ServerError> {
    let id = query
        .id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .ok_or_else(|| ServerError::validation("invalid media id"))?;
    let record = state
        .store
        .media_record(id)
        .ok_or_else(|| ServerError::not_found("unknown media record"))?;

    let content_type = HeaderValue::from_str(&record.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_MIME));
    let disposition = HeaderValue::from_str(&content_disposition(&record.filename))
        .map_err(|err| ServerError::internal(err.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(Bytes::copy_from_slice(&record.data)),
    )
        .into_response())
}

/// Inline `Content-Disposition` with an RFC 5987 encoded file name.
fn content_disposition(filename: &str) -> String {
    let mut encoded = String::with_capacity(filename.len());
    for byte in filename.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("inline; filename*=UTF-8''{encoded}")
}

// ============================================================================
// Settings API
// ============================================================================

/// Retention preferences as exchanged with the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prefs {
    pub log_size: usize,
    pub media_cache: usize,
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    old: String,
    confirm: String,
    new: String,
}

async fn api_get_prefs(_: Authenticated, State(state): State<AppState>) -> ApiResult<Prefs> {
    data(Prefs {
        log_size: state.settings.log_size(),
        media_cache: state.settings.media_cache_bytes(),
    })
}

/// POST /api/setprefs - Update retention limits and re-trim the store.
async fn api_set_prefs(_: Authenticated, State(state): State<AppState>, body: Bytes) -> ApiResult<bool> {
    let prefs: Prefs = parse_body(&body)?;

    state.settings.set_log_size(prefs.log_size)?;
    state.store.log_size_changed();
    state.settings.set_media_cache_bytes(prefs.media_cache)?;
    state.store.media_cache_changed();

    info!(
        log_size = prefs.log_size,
        media_cache = prefs.media_cache,
        "Updated retention settings"
    );
    data(true)
}

/// POST /api/chpass - Change the password.
async fn api_change_password(
    _: Authenticated,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<bool> {
    let request: ChangePasswordRequest = parse_body(&body)?;
    if request.new != request.confirm {
        return Err(ServerError::validation("passwords do not match"));
    }
    if !state.settings.check_password(&request.old) {
        warn!("Password change rejected: wrong current password");
        return Err(ServerError::validation("password incorrect"));
    }
    state.settings.set_password(&request.new)?;
    info!("Password changed");
    data(true)
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Deserialize)]
struct StreamQuery {
    service: Option<String>,
}

/// GET /api/serviceStream?service= - Tail one service over a WebSocket.
async fn api_service_stream(
    _: Authenticated,
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let service = query
        .service
        .ok_or_else(|| ServerError::validation("missing service parameter"))?;
    Ok(upgrade_stream(ws, state, Scope::Service(service)))
}

/// GET /api/fullStream - Tail every service over a WebSocket.
async fn api_full_stream(
    _: Authenticated,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade_stream(ws, state, Scope::Global)
}

fn upgrade_stream(ws: WebSocketUpgrade, state: AppState, scope: Scope) -> Response {
    let cancel = state.shutdown.child_token();
    info!(%scope, "Stream client connecting");

    ws.on_upgrade(move |socket| async move {
        let mut transport = WebSocketTransport::new(socket);
        match run_stream(state.store, scope.clone(), &mut transport, cancel).await {
            Ok(end) => info!(%scope, ?end, "Stream client disconnected"),
            Err(err) => {
                let err = ServerError::from(err);
                debug!(%scope, error = %err, "Stream client dropped");
            }
        }
    })
}

/// [`StreamTransport`] over an upgraded WebSocket; records are sent as JSON
/// text frames.
pub struct WebSocketTransport {
    socket: WebSocket,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl StreamTransport for WebSocketTransport {
    async fn send_record(&mut self, record: &LogRecord) -> Result<(), StreamError> {
        let json = serde_json::to_string(record)?;
        self.socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|err| StreamError::Send(err.to_string()))
    }

    async fn next_incoming(&mut self) -> Result<Incoming, StreamError> {
        match self.socket.next().await {
            None | Some(Ok(Message::Close(_))) => Ok(Incoming::Closed),
            Some(Ok(_)) => Ok(Incoming::Message),
            Some(Err(err)) => Err(StreamError::Receive(err.to_string())),
        }
    }

    async fn close(&mut self) {
        let _ = SinkExt::close(&mut self.socket).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
