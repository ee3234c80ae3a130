use crate::auth;
use crate::error::ApiError;
use crate::middleware::{auth_middleware, upgrade_dispatch, write_rate_limit_middleware};
use crate::ports;
use crate::proxy::proxy_handler;
use crate::state::GatewayState;
use axum::{
    extract::State,
    middleware as axum_mw,
    response::IntoResponse,
    routing::{any, delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vestibule_core::{VestibuleError, VestibuleResult};

/// The gateway front door.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the full router.
    ///
    /// Layering, outermost first: upgrade dispatch, then for protected
    /// routes auth followed by the write-rate limit. Public routes skip both.
    pub fn router(state: Arc<GatewayState>) -> Router {
        let public = Router::new()
            .route("/health", get(health_handler))
            .route("/api/status", get(status_handler))
            .route("/api/auth/status", get(auth::auth_status))
            .route("/api/auth/login", post(auth::login))
            .route("/api/auth/setup", post(auth::setup));

        let protected = Router::new()
            .route("/api/auth/logout", post(auth::logout))
            .route("/api/auth/sessions", get(auth::list_sessions))
            .route("/api/auth/sessions/{id}", delete(auth::revoke_session))
            .route("/api/auth/password", post(auth::change_password))
            .route("/api/auth/log", get(auth::audit_log))
            .route("/api/ports", get(ports::list_ports).post(ports::expose_port))
            .route("/api/ports/{port}", delete(ports::remove_port))
            .route("/api/{*rest}", any(proxy_handler))
            .route_layer(axum_mw::from_fn_with_state(
                Arc::clone(&state),
                write_rate_limit_middleware,
            ))
            .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), auth_middleware));

        public
            .merge(protected)
            .fallback(not_found)
            .layer(axum_mw::from_fn_with_state(Arc::clone(&state), upgrade_dispatch))
            .with_state(state)
    }

    /// Start the sweepers. They stop when `state.shutdown` is cancelled.
    pub fn spawn_background(state: &GatewayState) -> Vec<JoinHandle<()>> {
        let cancel = &state.shutdown;
        vec![
            state.auth_limiter.spawn_sweeper(cancel.child_token()),
            state.write_limiter.spawn_sweeper(cancel.child_token()),
            state.lockout.spawn_sweeper(cancel.child_token()),
            state.sessions.spawn_sweeper(cancel.child_token()),
        ]
    }

    /// Serve on `listener` until `signal` resolves or `state.shutdown` is
    /// cancelled. On the way out: stop accepting, close every tunnel, stop
    /// the sweepers, flush the audit log.
    pub async fn serve<F>(
        state: Arc<GatewayState>,
        listener: TcpListener,
        signal: F,
    ) -> VestibuleResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        state.ports.set_own_port(local.port());

        let tasks = Self::spawn_background(&state);
        let app = Self::router(Arc::clone(&state));

        let shutdown_state = Arc::clone(&state);
        let shutdown = async move {
            tokio::select! {
                () = signal => info!("Shutdown signal received"),
                () = shutdown_state.shutdown.cancelled() => {}
            }
            shutdown_state.tunnels.close_all();
            shutdown_state.shutdown.cancel();
        };

        info!(addr = %local, upstream = %state.proxy.base_url(), "Vestibule gateway listening");
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        // Covers the error path, where the shutdown future never ran.
        state.tunnels.close_all();
        state.shutdown.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        state.audit.flush().await;
        info!("Vestibule gateway stopped");

        served.map_err(VestibuleError::from)
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "vestibule" }))
}

async fn status_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let upstream = match state.proxy.probe().await {
        Ok(()) => "ok",
        Err(e) => {
            warn!(error = %e, "Upstream status probe failed");
            "unreachable"
        }
    };
    Json(json!({
        "status": if upstream == "ok" { "ok" } else { "degraded" },
        "configured": state.sessions.is_configured(),
        "upstream": upstream,
        "activeTunnels": state.tunnels.active_count(),
        "maxTunnels": state.tunnels.max_connections(),
    }))
}

async fn not_found() -> ApiError {
    VestibuleError::NotFound("no such route".into()).into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vestibule_security::{AuditConfig, AuditLog, HashingConfig};
    use vestibule_session::MemoryCredentialStore;

    async fn test_state(dir: &std::path::Path) -> Arc<GatewayState> {
        let config = GatewayConfig {
            hashing: HashingConfig::insecure_fast(),
            ..GatewayConfig::default()
        };
        let audit = Arc::new(AuditLog::new(dir.to_path_buf(), AuditConfig::default()));
        GatewayState::with_store(config, audit, Arc::new(MemoryCredentialStore::new()))
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path()).await;
        state.sessions.configure("correct horse battery", "127.0.0.1").await.unwrap();

        let response = GatewayServer::router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["service"], "vestibule");
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let tmp = tempfile::tempdir().unwrap();
        let app = GatewayServer::router(test_state(tmp.path()).await);

        let response = app
            .oneshot(Request::get("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_protected_routes_need_token_once_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path()).await;
        let app = GatewayServer::router(Arc::clone(&state));

        let open = app
            .clone()
            .oneshot(Request::get("/api/ports").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(open.status(), StatusCode::OK);

        state.sessions.configure("correct horse battery", "127.0.0.1").await.unwrap();

        let closed = app
            .clone()
            .oneshot(Request::get("/api/ports").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(closed.status(), StatusCode::UNAUTHORIZED);

        let status = app
            .oneshot(Request::get("/api/auth/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        assert_eq!(status.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(body_json(status).await["configured"], true);
    }

    #[tokio::test]
    async fn test_dot_segments_never_reach_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let app = GatewayServer::router(test_state(tmp.path()).await);

        for uri in ["/api/%2e%2e/internal/status", "/api/x/../../internal"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body_json(response).await["error"], "bad_request");
        }
    }

    #[tokio::test]
    async fn test_expose_port_through_router() {
        let tmp = tempfile::tempdir().unwrap();
        let app = GatewayServer::router(test_state(tmp.path()).await);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/ports")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"port":8080,"label":"dev server"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let listed = app
            .oneshot(Request::get("/api/ports").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(listed).await;
        assert_eq!(body["ports"][0]["port"], 8080);
        assert_eq!(body["ports"][0]["label"], "dev server");
    }
}
