use crate::config::GatewayConfig;
use crate::connection::TunnelRegistry;
use crate::ports::PortRegistry;
use crate::proxy::ReverseProxy;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vestibule_core::VestibuleResult;
use vestibule_security::{AuditLog, LockoutTracker, RateLimiter};
use vestibule_session::{CredentialStore, FileCredentialStore, SessionManager};

/// Everything a request handler can reach. Built once per process; tests
/// build their own.
pub struct GatewayState {
    /// Settings the state was built from.
    pub config: GatewayConfig,
    /// Password and session lifecycle.
    pub sessions: Arc<SessionManager>,
    /// Guards login and setup.
    pub auth_limiter: Arc<RateLimiter>,
    /// Guards non-GET requests on protected routes.
    pub write_limiter: Arc<RateLimiter>,
    /// Failed-login lockout per client IP.
    pub lockout: Arc<LockoutTracker>,
    /// Security event trail.
    pub audit: Arc<AuditLog>,
    /// HTTP forwarding to the runtime.
    pub proxy: ReverseProxy,
    /// Open WebSocket tunnels.
    pub tunnels: Arc<TunnelRegistry>,
    /// Ports exposed through the gateway.
    pub ports: PortRegistry,
    /// Cancelled once on shutdown; background tasks and tunnels hang off it.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    /// State backed by files under `data_dir` (`auth/` and `audit/`).
    pub async fn new(config: GatewayConfig, data_dir: &Path) -> VestibuleResult<Arc<Self>> {
        config.validate()?;
        let audit = Arc::new(AuditLog::new(data_dir.join("audit"), config.audit.clone()));
        let store = FileCredentialStore::new(data_dir.join("auth")).await?;
        Self::with_store(config, audit, Arc::new(store)).await
    }

    /// State with caller-supplied audit log and credential store.
    pub async fn with_store(
        config: GatewayConfig,
        audit: Arc<AuditLog>,
        credentials: Arc<dyn CredentialStore>,
    ) -> VestibuleResult<Arc<Self>> {
        config.validate()?;
        let sessions = Arc::new(
            SessionManager::new(
                config.session.clone(),
                &config.hashing,
                credentials,
                Arc::clone(&audit),
            )
            .await?,
        );
        let proxy = ReverseProxy::new(&config.upstream)?;
        let shutdown = CancellationToken::new();
        let tunnels = TunnelRegistry::new(config.tunnel.max_connections, shutdown.child_token());

        Ok(Arc::new(Self {
            sessions,
            auth_limiter: Arc::new(RateLimiter::new("auth", config.auth_rate_limit.clone())),
            write_limiter: Arc::new(RateLimiter::new("write", config.write_rate_limit.clone())),
            lockout: Arc::new(LockoutTracker::new(config.lockout.clone())),
            audit,
            proxy,
            tunnels,
            ports: PortRegistry::new(),
            shutdown,
            config,
        }))
    }
}
