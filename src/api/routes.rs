//! WebSocket server + REST endpoints for the relay control surface.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{DeviceGuard, DeviceId, Session, WebhookAuth};
use crate::delivery::{CompletionSignal, FailureStreak};
use crate::dispatch::{DispatchSupervisor, ProgressEvent, ProgressObserver, RunMode};
use crate::error::{AuthError, DispatchError};
use crate::store::{AccountStore, AuditSink};

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<DeviceGuard>,
    pub supervisor: Arc<DispatchSupervisor>,
    pub observer: Arc<ProgressObserver>,
    pub accounts: Arc<dyn AccountStore>,
    pub audit: Arc<dyn AuditSink>,
    /// Feeds the correlator.
    pub signals: mpsc::Sender<CompletionSignal>,
    /// Guards the delivery webhook.
    pub webhook: WebhookAuth,
    pub streak: Arc<FailureStreak>,
    /// This installation's identity, presented at registration and sign-in.
    pub device: DeviceId,
    /// Mode used when a start request doesn't name one.
    pub default_mode: RunMode,
    pub channel_names: Vec<String>,
}

/// Build the Axum router with the relay's WebSocket and REST routes.
pub fn relay_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/account", get(account))
        .route("/api/auth/register", post(register))
        .route("/api/auth/sign-in", post(sign_in))
        .route("/api/auth/sign-out", post(sign_out))
        .route("/api/dispatch/start", post(start_dispatch))
        .route("/api/dispatch/stop", post(stop_dispatch))
        .route("/api/delivery", post(delivery_report))
        .route("/api/logs", get(delivery_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({"error": message.to_string()})),
    )
        .into_response()
}

fn auth_error_response(e: AuthError) -> Response {
    let status = match &e {
        AuthError::MissingCredentials => StatusCode::BAD_REQUEST,
        AuthError::DeviceAlreadyBound | AuthError::AccountExists(_) => StatusCode::CONFLICT,
        AuthError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        AuthError::InvalidCredential => StatusCode::UNAUTHORIZED,
        AuthError::DeviceMismatch => StatusCode::FORBIDDEN,
        AuthError::Store(err) => {
            error!(error = %err, "Account store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e)
}

/// Resolve the signed-in session or answer 401.
async fn require_session(state: &AppState) -> Result<Session, Response> {
    match state.guard.current_session().await {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            DispatchError::NotAuthenticated,
        )),
        Err(e) => Err(auth_error_response(e)),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "sms-relay"
    }))
}

// ── Status ──────────────────────────────────────────────────────────────

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.guard.current_session().await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load session for status");
        None
    });

    Json(serde_json::json!({
        "state": state.supervisor.state(),
        "session": session,
        "failure_streak": state.streak.current(),
        "loop": state.supervisor.current().await,
        "device_id": state.device,
        "channels": state.channel_names,
    }))
}

async fn account(State(state): State<AppState>) -> Response {
    let session = match require_session(&state).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    match state.accounts.get_account(&session.account_id).await {
        Ok(Some(account)) => (StatusCode::OK, Json(serde_json::json!(account))).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            AuthError::AccountNotFound(session.account_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ── Auth ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CredentialsRequest {
    account_id: String,
    credential: String,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Response {
    let credential = SecretString::from(body.credential);
    match state
        .guard
        .register(&body.account_id, &credential, &state.device)
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(serde_json::json!(session))).into_response(),
        Err(e) => auth_error_response(e),
    }
}

async fn sign_in(State(state): State<AppState>, Json(body): Json<CredentialsRequest>) -> Response {
    let credential = SecretString::from(body.credential);
    match state
        .guard
        .sign_in(&body.account_id, &credential, &state.device)
        .await
    {
        Ok(session) => (StatusCode::OK, Json(serde_json::json!(session))).into_response(),
        Err(e) => auth_error_response(e),
    }
}

async fn sign_out(State(state): State<AppState>) -> Response {
    // No dispatching on behalf of a signed-out account
    state.supervisor.stop().await;
    match state.guard.sign_out().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "signed_out"})),
        )
            .into_response(),
        Err(e) => auth_error_response(e),
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default)]
    slot: usize,
    mode: Option<RunMode>,
}

async fn start_dispatch(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> Response {
    let mode = body.mode.unwrap_or(state.default_mode);

    match state.supervisor.start(body.slot, mode).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "started", "slot": body.slot, "mode": mode})),
        )
            .into_response(),
        Err(e @ DispatchError::NotAuthenticated) => error_response(StatusCode::UNAUTHORIZED, e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn stop_dispatch(State(state): State<AppState>) -> impl IntoResponse {
    let stopped = state.supervisor.stop().await;
    Json(serde_json::json!({"stopped": stopped, "state": state.supervisor.state()}))
}

// ── Delivery ────────────────────────────────────────────────────────────

/// Completion-signal webhook for channels that report out of band.
async fn delivery_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(signal): Json<CompletionSignal>,
) -> Response {
    if !state.webhook.is_enabled() {
        return error_response(StatusCode::FORBIDDEN, "Delivery webhook is disabled");
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !state.webhook.authorize(presented) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid webhook token");
    }

    debug!(job_id = ?signal.job_id, code = signal.result_code, "Delivery report received");
    match state.signals.send(signal).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "queued"})),
        )
            .into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Outcome queue closed"),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn delivery_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Response {
    let session = match require_session(&state).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);

    match state.audit.list_for_account(&session.account_id, limit).await {
        Ok(records) => (StatusCode::OK, Json(serde_json::json!(records))).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.observer))
}

async fn send_event(socket: &mut WebSocket, event: &ProgressEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize progress event");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, observer: Arc<ProgressObserver>) {
    info!("WebSocket client connected");

    // Subscribe before the initial sync so nothing falls between them
    let mut rx = observer.subscribe();

    let sync = ProgressEvent::State {
        state: observer.state(),
    };
    if !send_event(&mut socket, &sync).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        let sync = ProgressEvent::State { state: observer.state() };
                        if !send_event(&mut socket, &sync).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}
