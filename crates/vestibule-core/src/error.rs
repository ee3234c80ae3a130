use thiserror::Error;

/// A convenience `Result` alias using [`VestibuleError`].
pub type VestibuleResult<T> = Result<T, VestibuleError>;

/// Coarse grouping of errors by who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input, missing credentials, throttling. Safe to explain to the caller.
    Client,
    /// The runtime behind the gateway is unreachable, slow, or misconfigured.
    Upstream,
    /// The gateway itself is saturated.
    Capacity,
    /// Anything else. Details are logged, never returned.
    Internal,
}

/// Top-level error type for the Vestibule gateway.
#[derive(Error, Debug)]
pub enum VestibuleError {
    /// Malformed request input.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A proposed password violates the password policy.
    #[error("Invalid password: {0}")]
    InvalidPassword(String),

    /// Password did not match (or no password is configured).
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Missing, unknown, or expired session token.
    #[error("Unauthorized")]
    Unauthorized,

    /// The addressed resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// First-time setup was attempted after a password was already set.
    #[error("A password is already configured")]
    AlreadyConfigured,

    /// The request conflicts with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Too many requests in the current window.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the current window ends.
        retry_after_secs: u64,
    },

    /// Too many failed logins; the actor is temporarily locked out.
    #[error("Too many failed attempts, retry after {retry_after_secs}s")]
    LockedOut {
        /// Seconds until the lock elapses.
        retry_after_secs: u64,
    },

    /// The runtime could not be reached.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The runtime did not answer within the configured timeout.
    #[error("Upstream timed out")]
    UpstreamTimeout,

    /// The runtime redirected back to the gateway, which means the shared
    /// secret or upstream URL is wrong.
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// The tunnel cap is reached.
    #[error("Too many active connections (limit {limit})")]
    CapacityExceeded {
        /// The configured cap.
        limit: usize,
    },

    /// Invalid gateway configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Hashing or randomness failure.
    #[error("Security error: {0}")]
    Security(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VestibuleError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BadRequest(_)
            | Self::InvalidPassword(_)
            | Self::InvalidCredentials
            | Self::Unauthorized
            | Self::NotFound(_)
            | Self::AlreadyConfigured
            | Self::Conflict(_)
            | Self::RateLimited { .. }
            | Self::LockedOut { .. } => ErrorClass::Client,
            Self::UpstreamUnavailable(_) | Self::UpstreamTimeout | Self::ConfigMismatch(_) => {
                ErrorClass::Upstream
            }
            Self::CapacityExceeded { .. } => ErrorClass::Capacity,
            Self::Config(_)
            | Self::Security(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::InvalidPassword(_) => 400,
            Self::InvalidCredentials | Self::Unauthorized => 401,
            Self::NotFound(_) => 404,
            Self::AlreadyConfigured | Self::Conflict(_) => 409,
            Self::RateLimited { .. } | Self::LockedOut { .. } => 429,
            Self::UpstreamUnavailable(_) => 502,
            Self::ConfigMismatch(_) | Self::CapacityExceeded { .. } => 503,
            Self::UpstreamTimeout => 504,
            Self::Config(_)
            | Self::Security(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code returned in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::InvalidPassword(_) => "invalid_password",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::AlreadyConfigured => "already_configured",
            Self::Conflict(_) => "conflict",
            Self::RateLimited { .. } => "rate_limited",
            Self::LockedOut { .. } => "locked_out",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::ConfigMismatch(_) => "config_mismatch",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Config(_)
            | Self::Security(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Internal(_) => "internal_error",
        }
    }

    /// Seconds the caller should wait before retrying, for throttling errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } | Self::LockedOut { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }

    /// Message that is safe to return to the caller. Internal errors are
    /// collapsed to a generic message so no detail leaks.
    pub fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::Internal => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(VestibuleError::InvalidCredentials.status_code(), 401);
        assert_eq!(
            VestibuleError::LockedOut { retry_after_secs: 3 }.status_code(),
            429
        );
        assert_eq!(
            VestibuleError::UpstreamUnavailable("refused".into()).status_code(),
            502
        );
        assert_eq!(VestibuleError::UpstreamTimeout.status_code(), 504);
        assert_eq!(
            VestibuleError::ConfigMismatch("loop".into()).status_code(),
            503
        );
        assert_eq!(
            VestibuleError::CapacityExceeded { limit: 4 }.status_code(),
            503
        );
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let err = VestibuleError::Internal("db password is hunter2".into());
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(err.code(), "internal_error");
    }

    #[test]
    fn test_retry_after_only_for_throttling() {
        assert_eq!(
            VestibuleError::RateLimited { retry_after_secs: 7 }.retry_after_secs(),
            Some(7)
        );
        assert_eq!(VestibuleError::Unauthorized.retry_after_secs(), None);
    }
}
