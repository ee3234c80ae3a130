use axum::http::HeaderName;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use vestibule_core::{VestibuleError, VestibuleResult};
use vestibule_security::{AuditConfig, HashingConfig, LockoutConfig, RateLimitConfig};
use vestibule_session::SessionConfig;

/// Everything the gateway needs at runtime. Loaded from the `[gateway]`
/// table of `vestibule.toml`; every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Take the client IP from the first `x-forwarded-for` hop instead of the
    /// socket peer. Only enable behind a trusted proxy.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// The runtime being fronted.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Limiter for login and setup.
    #[serde(default = "default_auth_rate_limit")]
    pub auth_rate_limit: RateLimitConfig,
    /// Limiter for state-changing requests on protected routes.
    #[serde(default = "default_write_rate_limit")]
    pub write_rate_limit: RateLimitConfig,
    /// Failed-login lockout.
    #[serde(default)]
    pub lockout: LockoutConfig,
    /// Session lifetime.
    #[serde(default)]
    pub session: SessionConfig,
    /// Argon2id cost for new hashes.
    #[serde(default)]
    pub hashing: HashingConfig,
    /// WebSocket tunnel limits.
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Audit log batching.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_for: false,
            upstream: UpstreamConfig::default(),
            auth_rate_limit: default_auth_rate_limit(),
            write_rate_limit: default_write_rate_limit(),
            lockout: LockoutConfig::default(),
            session: SessionConfig::default(),
            hashing: HashingConfig::default(),
            tunnel: TunnelConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

fn default_auth_rate_limit() -> RateLimitConfig {
    RateLimitConfig::new(10, 60_000)
}
fn default_write_rate_limit() -> RateLimitConfig {
    RateLimitConfig::new(300, 60_000)
}

impl GatewayConfig {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> VestibuleResult<()> {
        self.upstream.validate()?;

        for (name, limit) in [
            ("auth_rate_limit", &self.auth_rate_limit),
            ("write_rate_limit", &self.write_rate_limit),
        ] {
            if limit.max_requests == 0 || limit.window_ms == 0 {
                return Err(VestibuleError::Config(format!(
                    "{name}: max_requests and window_ms must be greater than zero"
                )));
            }
        }
        if self.lockout.threshold == 0 || self.lockout.duration_secs == 0 {
            return Err(VestibuleError::Config(
                "lockout: threshold and duration_secs must be greater than zero".into(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(VestibuleError::Config(
                "session.ttl_secs must be greater than zero".into(),
            ));
        }
        if self.tunnel.max_connections == 0 {
            return Err(VestibuleError::Config(
                "tunnel.max_connections must be greater than zero".into(),
            ));
        }
        if self.tunnel.ping_interval_ms == 0 {
            return Err(VestibuleError::Config(
                "tunnel.ping_interval_ms must be greater than zero".into(),
            ));
        }
        if self.audit.batch_size == 0 {
            return Err(VestibuleError::Config(
                "audit.batch_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// The runtime the gateway fronts.
#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Where requests are forwarded. Must be http or https.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Shared secret injected on every upstream request. Empty disables it.
    #[serde(default)]
    pub internal_secret: String,
    /// Header that carries the shared secret.
    #[serde(default = "default_secret_header")]
    pub secret_header: String,
    /// Liveness path; must answer `{"status":"ok"}`.
    #[serde(default = "default_status_path")]
    pub status_path: String,
    /// Deadline for one proxied request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for the upstream WebSocket handshake.
    #[serde(default = "default_upgrade_timeout_ms")]
    pub upgrade_timeout_ms: u64,
    /// Largest request body accepted for proxying.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            internal_secret: String::new(),
            secret_header: default_secret_header(),
            status_path: default_status_path(),
            request_timeout_ms: default_request_timeout_ms(),
            upgrade_timeout_ms: default_upgrade_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// Keeps the secret out of `{:?}` output.
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field(
                "internal_secret",
                &if self.internal_secret.is_empty() {
                    "<unset>"
                } else {
                    "<redacted>"
                },
            )
            .field("secret_header", &self.secret_header)
            .field("status_path", &self.status_path)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("upgrade_timeout_ms", &self.upgrade_timeout_ms)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:4000".to_string()
}
fn default_secret_header() -> String {
    "x-internal-secret".to_string()
}
fn default_status_path() -> String {
    "/internal/status".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_upgrade_timeout_ms() -> u64 {
    10_000
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl UpstreamConfig {
    /// Per-request deadline for proxied HTTP calls.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Deadline for the upstream side of a WebSocket handshake.
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.upgrade_timeout_ms)
    }

    /// Parsed and checked base URL.
    pub fn parsed_base_url(&self) -> VestibuleResult<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            VestibuleError::Config(format!("upstream.base_url '{}': {e}", self.base_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(VestibuleError::Config(format!(
                "upstream.base_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(VestibuleError::Config(
                "upstream.base_url has no host".into(),
            ));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(VestibuleError::Config(
                "upstream.base_url must not carry a query or fragment".into(),
            ));
        }
        Ok(url)
    }

    fn validate(&self) -> VestibuleResult<()> {
        self.parsed_base_url()?;
        HeaderName::from_bytes(self.secret_header.as_bytes()).map_err(|_| {
            VestibuleError::Config(format!(
                "upstream.secret_header '{}' is not a valid header name",
                self.secret_header
            ))
        })?;
        if !self.status_path.starts_with('/') {
            return Err(VestibuleError::Config(
                "upstream.status_path must start with '/'".into(),
            ));
        }
        if self.request_timeout_ms == 0 || self.upgrade_timeout_ms == 0 {
            return Err(VestibuleError::Config(
                "upstream timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// WebSocket tunnel limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Concurrent tunnels allowed, counting ones still connecting upstream.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Milliseconds between pings to the client.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

fn default_max_connections() -> usize {
    64
}
fn default_ping_interval_ms() -> u64 {
    30_000
}

impl TunnelConfig {
    /// Interval between pings sent to tunnel clients.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// A tunnel with no pong for longer than this is torn down.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.saturating_mul(5) / 2)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auth_rate_limit.max_requests, 10);
        assert_eq!(config.write_rate_limit.max_requests, 300);
        assert_eq!(config.tunnel.max_connections, 64);
        assert_eq!(config.upstream.secret_header, "x-internal-secret");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"upstream": {"base_url": "http://10.0.0.5:9000"}, "tunnel": {"max_connections": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.upstream.base_url, "http://10.0.0.5:9000");
        assert_eq!(config.upstream.request_timeout_ms, 30_000);
        assert_eq!(config.tunnel.max_connections, 4);
        assert_eq!(config.tunnel.ping_interval_ms, 30_000);
        assert_eq!(config.lockout.threshold, 5);
    }

    #[test]
    fn test_rejects_bad_upstream() {
        let mut config = GatewayConfig::default();
        config.upstream.base_url = "ftp://runtime".into();
        assert!(config.validate().is_err());

        config.upstream.base_url = "not a url".into();
        assert!(config.validate().is_err());

        config.upstream.base_url = "http://runtime:4000?x=1".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = GatewayConfig::default();
        config.auth_rate_limit.max_requests = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.tunnel.ping_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.upstream.secret_header = "bad header".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_liveness_timeout_is_two_and_a_half_intervals() {
        let tunnel = TunnelConfig {
            max_connections: 1,
            ping_interval_ms: 1_000,
        };
        assert_eq!(tunnel.liveness_timeout(), Duration::from_millis(2_500));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let upstream = UpstreamConfig {
            internal_secret: "hunter2-hunter2".into(),
            ..UpstreamConfig::default()
        };
        let printed = format!("{upstream:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
