use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifetime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle lifetime; every authenticated request pushes expiry this far out.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// How often expired sessions are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    pub(crate) fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs.min(MAX_TTL_SECS) as i64)
    }
}

const MAX_TTL_SECS: u64 = 365 * 24 * 3600;

fn default_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_sweep_interval_secs() -> u64 {
    60
}

/// A login session. The token itself is not stored here; the manager keys
/// sessions by the token's digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Public session id, safe to show to other sessions.
    pub id: Uuid,
    /// Client-supplied device label.
    pub device_id: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last successful validation.
    pub last_seen_at: DateTime<Utc>,
    /// Moves forward each time the session is touched.
    pub expires_at: DateTime<Utc>,
    /// Client IP at login.
    pub ip: String,
}

impl Session {
    /// A fresh session for `device_id` that expires after `ttl`.
    pub fn new(device_id: impl Into<String>, ip: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            created_at: now,
            last_seen_at: now,
            expires_at: now + ttl,
            ip: ip.into(),
        }
    }

    /// True once `now` is past the expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Sliding expiration.
    pub fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.last_seen_at = now;
        self.expires_at = now + ttl;
    }
}

/// Session as shown in `GET /api/auth/sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// The session itself, flattened into the JSON object.
    #[serde(flatten)]
    pub session: Session,
    /// True for the session making the request.
    pub current: bool,
}
