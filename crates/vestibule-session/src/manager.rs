use crate::session::{Session, SessionConfig, SessionInfo};
use crate::store::{CredentialStore, StoredCredential};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vestibule_core::{VestibuleError, VestibuleResult};
use vestibule_security::audit::{AuditEntry, AuditEvent};
use vestibule_security::password::{generate_token, token_digest, validate_password_policy};
use vestibule_security::{AuditLog, HashingConfig, PasswordHashing};

const DUMMY_PASSWORD: &str = "vestibule-timing-equaliser";
const UNKNOWN_DEVICE: &str = "unknown";

/// Result of a password login attempt.
#[derive(Debug)]
pub enum LoginOutcome {
    /// Password accepted; a new session was created.
    Success {
        /// Bearer token; returned once, only its digest is kept.
        token: String,
        /// The new session.
        session: Session,
    },
    /// Password rejected, or no password is configured. No state was created.
    Rejected,
}

#[derive(Default)]
struct SessionTable {
    by_digest: HashMap<String, Session>,
    by_id: HashMap<Uuid, String>,
}

impl SessionTable {
    fn insert(&mut self, digest: String, session: Session) {
        self.by_id.insert(session.id, digest.clone());
        self.by_digest.insert(digest, session);
    }

    fn remove_digest(&mut self, digest: &str) -> Option<Session> {
        let session = self.by_digest.remove(digest)?;
        self.by_id.remove(&session.id);
        Some(session)
    }

    fn remove_id(&mut self, id: Uuid) -> Option<Session> {
        let digest = self.by_id.remove(&id)?;
        self.by_digest.remove(&digest)
    }

    fn clear(&mut self) -> usize {
        let count = self.by_digest.len();
        self.by_digest.clear();
        self.by_id.clear();
        count
    }
}

/// Owns the gateway password and every login session.
///
/// Lock order is `sessions` before `password_hash`. Issuing a session and
/// rotating the password both happen under the `sessions` lock, so a login
/// verified against an old password can never slip a session in after a
/// password change has cleared the table.
pub struct SessionManager {
    config: SessionConfig,
    hashing: PasswordHashing,
    credentials: Arc<dyn CredentialStore>,
    password_hash: RwLock<Option<String>>,
    dummy_hash: String,
    sessions: Mutex<SessionTable>,
    write_lock: tokio::sync::Mutex<()>,
    audit: Arc<AuditLog>,
}

impl SessionManager {
    /// Load the stored credential (if any) and prepare the manager.
    pub async fn new(
        config: SessionConfig,
        hashing: &HashingConfig,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<AuditLog>,
    ) -> VestibuleResult<Self> {
        let hashing = PasswordHashing::new(hashing)?;
        let stored = credentials.load().await?;
        let dummy_hash = hash_blocking(&hashing, DUMMY_PASSWORD.to_string()).await?;

        info!(configured = stored.is_some(), "Session manager ready");

        Ok(Self {
            config,
            hashing,
            credentials,
            password_hash: RwLock::new(stored.map(|c| c.password_hash)),
            dummy_hash,
            sessions: Mutex::new(SessionTable::default()),
            write_lock: tokio::sync::Mutex::new(()),
            audit,
        })
    }

    /// Whether a password has been set. Until then, protected routes are open.
    pub fn is_configured(&self) -> bool {
        self.password_hash.read().is_some()
    }

    /// First-time setup.
    pub async fn configure(&self, password: &str, actor_ip: &str) -> VestibuleResult<()> {
        validate_password_policy(password)?;
        let _guard = self.write_lock.lock().await;
        if self.is_configured() {
            return Err(VestibuleError::AlreadyConfigured);
        }

        let hash = hash_blocking(&self.hashing, password.to_string()).await?;
        self.credentials
            .save(&StoredCredential {
                password_hash: hash.clone(),
                updated_at: Utc::now(),
            })
            .await?;
        *self.password_hash.write() = Some(hash);

        self.audit
            .log_event(AuditEvent::PasswordConfigured, actor_ip, None, None);
        Ok(())
    }

    /// Check a password and, on success, create a session.
    ///
    /// When no password is configured the candidate is checked against a
    /// dummy hash so the response time matches a wrong password.
    pub async fn validate_password(
        &self,
        candidate: &str,
        actor_ip: &str,
        device_id: Option<&str>,
    ) -> VestibuleResult<LoginOutcome> {
        let device_id = normalize_device(device_id);
        let stored = self.password_hash.read().clone();
        let (phc, configured) = match stored {
            Some(hash) => (hash, true),
            None => (self.dummy_hash.clone(), false),
        };

        let matched =
            verify_blocking(&self.hashing, candidate.to_string(), phc.clone()).await? && configured;
        if !matched {
            self.audit
                .log_event(AuditEvent::LoginFailure, actor_ip, None, Some(&device_id));
            return Ok(LoginOutcome::Rejected);
        }

        let issued = {
            let mut table = self.sessions.lock();
            // The password may have rotated while we were hashing.
            if self.password_hash.read().as_deref() != Some(phc.as_str()) {
                None
            } else {
                Some(self.issue_session(&mut table, &device_id, actor_ip)?)
            }
        };

        match issued {
            Some((token, session)) => {
                self.audit.log(
                    AuditEntry::new(AuditEvent::LoginSuccess, actor_ip)
                        .with_session(session.id)
                        .with_device(device_id),
                );
                Ok(LoginOutcome::Success { token, session })
            }
            None => {
                warn!(actor = %actor_ip, "Password rotated during login, rejecting");
                self.audit
                    .log_event(AuditEvent::LoginFailure, actor_ip, None, Some(&device_id));
                Ok(LoginOutcome::Rejected)
            }
        }
    }

    /// Look a token up. Does not extend its expiry.
    pub fn validate_session(&self, token: &str) -> Option<Session> {
        let digest = token_digest(token);
        let table = self.sessions.lock();
        table
            .by_digest
            .get(&digest)
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned()
    }

    /// Extend a live session's expiry. Returns the updated session.
    pub fn touch_session(&self, token: &str) -> Option<Session> {
        let digest = token_digest(token);
        let ttl = self.config.ttl();
        let mut table = self.sessions.lock();
        let session = table.by_digest.get_mut(&digest)?;
        if session.is_expired(Utc::now()) {
            return None;
        }
        session.touch(ttl);
        Some(session.clone())
    }

    /// Log out. Idempotent; returns whether a session was removed.
    pub fn invalidate_session(&self, token: &str, actor_ip: &str) -> bool {
        let removed = self.sessions.lock().remove_digest(&token_digest(token));
        match removed {
            Some(session) => {
                self.audit.log(
                    AuditEntry::new(AuditEvent::Logout, actor_ip)
                        .with_session(session.id)
                        .with_device(session.device_id),
                );
                true
            }
            None => false,
        }
    }

    /// Revoke by session id. Idempotent; returns whether a session was removed.
    pub fn revoke_session_by_id(&self, id: Uuid, actor_ip: &str) -> bool {
        let removed = self.sessions.lock().remove_id(id);
        match removed {
            Some(session) => {
                self.audit.log(
                    AuditEntry::new(AuditEvent::SessionRevoked, actor_ip)
                        .with_session(session.id)
                        .with_device(session.device_id),
                );
                true
            }
            None => false,
        }
    }

    /// All live sessions, oldest first, flagging the one behind `current_token`.
    pub fn list_sessions(&self, current_token: Option<&str>) -> Vec<SessionInfo> {
        let current_digest = current_token.map(token_digest);
        let now = Utc::now();
        let table = self.sessions.lock();
        let mut sessions: Vec<SessionInfo> = table
            .by_digest
            .iter()
            .filter(|(_, s)| !s.is_expired(now))
            .map(|(digest, s)| SessionInfo {
                session: s.clone(),
                current: current_digest.as_deref() == Some(digest.as_str()),
            })
            .collect();
        sessions.sort_by_key(|info| info.session.created_at);
        sessions
    }

    /// Rotate the password. Every existing session is destroyed and one new
    /// session is issued to the caller; its token is returned.
    pub async fn change_password(
        &self,
        current: &str,
        new_password: &str,
        actor_ip: &str,
        device_id: Option<&str>,
    ) -> VestibuleResult<String> {
        validate_password_policy(new_password)?;
        let device_id = normalize_device(device_id);
        let _guard = self.write_lock.lock().await;

        let Some(phc) = self.password_hash.read().clone() else {
            return Err(VestibuleError::BadRequest(
                "no password is configured yet".into(),
            ));
        };

        if !verify_blocking(&self.hashing, current.to_string(), phc).await? {
            self.audit.log(
                AuditEntry::new(AuditEvent::LoginFailure, actor_ip)
                    .with_device(device_id)
                    .with_metadata(serde_json::json!({ "operation": "change_password" })),
            );
            return Err(VestibuleError::InvalidCredentials);
        }

        let new_hash = hash_blocking(&self.hashing, new_password.to_string()).await?;
        self.credentials
            .save(&StoredCredential {
                password_hash: new_hash.clone(),
                updated_at: Utc::now(),
            })
            .await?;

        let (revoked, token, session) = {
            let mut table = self.sessions.lock();
            *self.password_hash.write() = Some(new_hash);
            let revoked = table.clear();
            let (token, session) = self.issue_session(&mut table, &device_id, actor_ip)?;
            (revoked, token, session)
        };

        self.audit.log(
            AuditEntry::new(AuditEvent::PasswordChanged, actor_ip)
                .with_session(session.id)
                .with_device(session.device_id)
                .with_metadata(serde_json::json!({ "revokedSessions": revoked })),
        );
        Ok(token)
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut table = self.sessions.lock();
        let expired: Vec<String> = table
            .by_digest
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(digest, _)| digest.clone())
            .collect();
        for digest in &expired {
            table.remove_digest(digest);
        }
        expired.len()
    }

    /// Number of sessions held, including expired ones not yet swept.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().by_digest.len()
    }

    /// Run [`Self::sweep_expired`] periodically until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Swept expired sessions");
                        }
                    }
                }
            }
        })
    }

    fn issue_session(
        &self,
        table: &mut SessionTable,
        device_id: &str,
        ip: &str,
    ) -> VestibuleResult<(String, Session)> {
        let (token, digest) = loop {
            let token = generate_token()?;
            let digest = token_digest(&token);
            if !table.by_digest.contains_key(&digest) {
                break (token, digest);
            }
        };
        let session = Session::new(device_id, ip, self.config.ttl());
        table.insert(digest, session.clone());
        Ok((token, session))
    }
}

fn normalize_device(device_id: Option<&str>) -> String {
    match device_id.map(str::trim) {
        Some(d) if !d.is_empty() => d.chars().take(128).collect(),
        _ => UNKNOWN_DEVICE.to_string(),
    }
}

async fn hash_blocking(hashing: &PasswordHashing, password: String) -> VestibuleResult<String> {
    let hashing = hashing.clone();
    tokio::task::spawn_blocking(move || hashing.hash(&password))
        .await
        .map_err(|e| VestibuleError::Internal(format!("Hashing task failed: {e}")))?
}

async fn verify_blocking(
    hashing: &PasswordHashing,
    candidate: String,
    phc: String,
) -> VestibuleResult<bool> {
    let hashing = hashing.clone();
    tokio::task::spawn_blocking(move || hashing.verify(&candidate, &phc))
        .await
        .map_err(|e| VestibuleError::Internal(format!("Verification task failed: {e}")))
}
