use crate::error::ApiError;
use crate::state::GatewayState;
use crate::tunnel;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, Extensions, HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use vestibule_core::VestibuleError;
use vestibule_session::Session;

/// Caller identity attached by [`auth_middleware`].
///
/// Both fields are `None` while no password is configured, since protected
/// routes are open until then.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Bearer token the request carried.
    pub token: Option<String>,
    /// Session the token resolved to.
    pub session: Option<Session>,
}

/// Client IP used as the rate-limit, lockout and audit key.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<GatewayState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<GatewayState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(resolve_client_ip(
            &parts.headers,
            &parts.extensions,
            state.config.trust_forwarded_for,
        )))
    }
}

/// Socket peer address, or the first `x-forwarded-for` hop when trusted.
pub fn resolve_client_ip(headers: &HeaderMap, extensions: &Extensions, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// True for `Upgrade: websocket` requests, matched case-insensitively.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("websocket")))
}

/// Auth middleware: validates and touches the bearer session.
///
/// Until a password is configured every request passes with an empty
/// [`AuthContext`].
pub async fn auth_middleware(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.sessions.is_configured() {
        request.extensions_mut().insert(AuthContext::default());
        return Ok(next.run(request).await);
    }

    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        debug!(path = %request.uri().path(), "Rejected request: missing session token");
        return Err(VestibuleError::Unauthorized.into());
    };

    match state.sessions.touch_session(&token) {
        Some(session) => {
            request.extensions_mut().insert(AuthContext {
                token: Some(token),
                session: Some(session),
            });
            Ok(next.run(request).await)
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: invalid or expired session");
            Err(VestibuleError::Unauthorized.into())
        }
    }
}

/// Write-rate middleware: limits state-changing requests per client IP.
pub async fn write_rate_limit_middleware(
    State(state): State<Arc<GatewayState>>,
    ClientIp(ip): ClientIp,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return Ok(next.run(request).await);
    }

    let decision = state.write_limiter.check(&ip);
    if !decision.allowed {
        warn!(client_ip = %ip, method = %request.method(), "Rate limited write request");
        return Err(VestibuleError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        }
        .into());
    }
    Ok(next.run(request).await)
}

/// Outermost layer: WebSocket upgrades skip the HTTP chain and go straight
/// to the tunnel, which does its own auth.
pub async fn upgrade_dispatch(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    if is_websocket_upgrade(request.headers()) {
        return tunnel::handle_upgrade(state, request).await;
    }
    next.run(request).await
}
