use crate::error::{ApiError, ApiJson};
use crate::middleware::{AuthContext, ClientIp};
use crate::state::GatewayState;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use vestibule_core::{VestibuleError, VestibuleResult};
use vestibule_security::audit::AuditEntry;
use vestibule_security::{AuditEvent, LockoutStatus, LoginAttempt};
use vestibule_session::LoginOutcome;

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

/// Body of `login` and `setup`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordRequest {
    /// Plaintext password.
    pub password: String,
    /// Defaults to `"unknown"`.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Body of `change_password`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    /// Must match the stored hash.
    pub current_password: String,
    /// Checked against the password policy.
    pub new_password: String,
}

/// Query of `audit_log`.
#[derive(Deserialize)]
pub struct LogQuery {
    /// Defaults to 50, capped at 500.
    pub limit: Option<usize>,
}

/// Per-IP volume limit for the auth routes.
fn check_auth_rate(state: &GatewayState, ip: &str) -> VestibuleResult<()> {
    let decision = state.auth_limiter.check(ip);
    if !decision.allowed {
        warn!(client_ip = %ip, "Auth rate limit exceeded");
        return Err(VestibuleError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        });
    }
    Ok(())
}

fn locked_out(status: LockoutStatus) -> VestibuleError {
    VestibuleError::LockedOut {
        retry_after_secs: status.retry_after_secs,
    }
}

/// Auth limiter first, then reserve a lockout slot for one password check.
/// Both refusals answer 429 with a retry hint.
fn begin_password_check<'a>(state: &'a GatewayState, ip: &str) -> VestibuleResult<LoginAttempt<'a>> {
    check_auth_rate(state, ip)?;
    state.lockout.begin_attempt(ip).map_err(locked_out)
}

/// Count a failed password check against the caller's IP.
fn record_failure(state: &GatewayState, ip: &str, attempt: LoginAttempt<'_>) {
    let status = attempt.fail();
    if status.locked {
        warn!(client_ip = %ip, retry_after_secs = status.retry_after_secs, "Client locked out");
        state.audit.log(
            AuditEntry::new(AuditEvent::LockoutTriggered, ip)
                .with_metadata(json!({ "retryAfter": status.retry_after_secs })),
        );
    }
}

/// Settle a successful check. A lock that landed meanwhile voids `token`.
fn settle_success(
    state: &GatewayState,
    ip: &str,
    attempt: LoginAttempt<'_>,
    token: &str,
) -> VestibuleResult<()> {
    if let Err(status) = attempt.succeed() {
        state.sessions.invalidate_session(token, ip);
        warn!(client_ip = %ip, "Correct password while locked out; session withdrawn");
        return Err(locked_out(status));
    }
    Ok(())
}

/// `GET /api/auth/status`
pub async fn auth_status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(json!({ "configured": state.sessions.is_configured() })),
    )
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): State<Arc<GatewayState>>,
    ClientIp(ip): ClientIp,
    ApiJson(req): ApiJson<PasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = begin_password_check(&state, &ip)?;

    match state
        .sessions
        .validate_password(&req.password, &ip, req.device_id.as_deref())
        .await?
    {
        LoginOutcome::Success { token, session } => {
            settle_success(&state, &ip, attempt, &token)?;
            info!(session_id = %session.id, client_ip = %ip, "Login succeeded");
            Ok(Json(json!({
                "success": true,
                "token": token,
                "sessionId": session.id,
                "expiresAt": session.expires_at,
            })))
        }
        LoginOutcome::Rejected => {
            record_failure(&state, &ip, attempt);
            Err(VestibuleError::InvalidCredentials.into())
        }
    }
}

/// `POST /api/auth/setup`: set the first password and log the caller in.
pub async fn setup(
    State(state): State<Arc<GatewayState>>,
    ClientIp(ip): ClientIp,
    ApiJson(req): ApiJson<PasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth_rate(&state, &ip)?;
    let lock = state.lockout.check_lockout(&ip);
    if lock.locked {
        return Err(locked_out(lock).into());
    }
    state.sessions.configure(&req.password, &ip).await?;
    info!(client_ip = %ip, "Gateway password configured");

    match state
        .sessions
        .validate_password(&req.password, &ip, req.device_id.as_deref())
        .await?
    {
        LoginOutcome::Success { token, session } => Ok(Json(json!({
            "success": true,
            "token": token,
            "sessionId": session.id,
            "expiresAt": session.expires_at,
        }))),
        LoginOutcome::Rejected => Err(VestibuleError::Conflict(
            "password changed during setup; log in again".into(),
        )
        .into()),
    }
}

/// `POST /api/auth/logout`
pub async fn logout(
    State(state): State<Arc<GatewayState>>,
    ClientIp(ip): ClientIp,
    Extension(ctx): Extension<AuthContext>,
) -> impl IntoResponse {
    if let Some(token) = ctx.token.as_deref() {
        state.sessions.invalidate_session(token, &ip);
    }
    Json(json!({ "success": true }))
}

/// `GET /api/auth/sessions`
pub async fn list_sessions(
    State(state): State<Arc<GatewayState>>,
    Extension(ctx): Extension<AuthContext>,
) -> impl IntoResponse {
    let sessions = state.sessions.list_sessions(ctx.token.as_deref());
    Json(json!({ "sessions": sessions }))
}

/// `DELETE /api/auth/sessions/{id}`
pub async fn revoke_session(
    State(state): State<Arc<GatewayState>>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| VestibuleError::BadRequest(format!("'{id}' is not a session id")))?;
    if !state.sessions.revoke_session_by_id(id, &ip) {
        return Err(VestibuleError::NotFound(format!("session {id}")).into());
    }
    info!(session_id = %id, client_ip = %ip, "Session revoked");
    Ok(Json(json!({ "success": true })))
}

/// `POST /api/auth/password`: rotate the password. Every session ends and
/// the caller gets a fresh token.
pub async fn change_password(
    State(state): State<Arc<GatewayState>>,
    ClientIp(ip): ClientIp,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt = begin_password_check(&state, &ip)?;
    let device_id = ctx.session.as_ref().map(|s| s.device_id.as_str());

    match state
        .sessions
        .change_password(&req.current_password, &req.new_password, &ip, device_id)
        .await
    {
        Ok(token) => {
            settle_success(&state, &ip, attempt, &token)?;
            info!(client_ip = %ip, "Password changed");
            Ok(Json(json!({ "success": true, "token": token })))
        }
        Err(VestibuleError::InvalidCredentials) => {
            record_failure(&state, &ip, attempt);
            Err(VestibuleError::InvalidCredentials.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// `GET /api/auth/log?limit=`: newest audit entries first.
pub async fn audit_log(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    Json(json!({ "entries": state.audit.recent(limit) }))
}
