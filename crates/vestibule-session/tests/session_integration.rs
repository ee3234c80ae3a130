#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use vestibule_core::VestibuleError;
use vestibule_security::{AuditConfig, AuditLog, HashingConfig};
use vestibule_session::{
    CredentialStore, FileCredentialStore, LoginOutcome, SessionConfig, SessionManager,
};

const PASSWORD: &str = "correct horse battery";

/// Helper: a manager backed by a file store in a temp directory.
async fn temp_manager() -> (Arc<SessionManager>, Arc<AuditLog>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let (manager, audit) = manager_at(tmp.path()).await;
    (manager, audit, tmp)
}

async fn manager_at(dir: &std::path::Path) -> (Arc<SessionManager>, Arc<AuditLog>) {
    let audit = Arc::new(AuditLog::new(dir.join("audit"), AuditConfig::default()));
    let store = FileCredentialStore::new(dir.join("auth")).await.unwrap();
    let manager = SessionManager::new(
        SessionConfig::default(),
        &HashingConfig::insecure_fast(),
        Arc::new(store),
        Arc::clone(&audit),
    )
    .await
    .unwrap();
    (Arc::new(manager), audit)
}

async fn login(manager: &SessionManager, password: &str, device: &str) -> Option<String> {
    match manager
        .validate_password(password, "192.168.1.50", Some(device))
        .await
        .unwrap()
    {
        LoginOutcome::Success { token, .. } => Some(token),
        LoginOutcome::Rejected => None,
    }
}

#[tokio::test]
async fn test_session_valid_until_invalidated() {
    let (manager, _audit, _tmp) = temp_manager().await;
    manager.configure(PASSWORD, "192.168.1.50").await.unwrap();

    let token = login(&manager, PASSWORD, "laptop").await.unwrap();
    for _ in 0..3 {
        assert!(manager.touch_session(&token).is_some());
    }
    assert_eq!(manager.validate_session(&token).unwrap().device_id, "laptop");

    assert!(manager.invalidate_session(&token, "192.168.1.50"));
    assert!(manager.validate_session(&token).is_none());
}

#[tokio::test]
async fn test_change_password_invalidates_every_other_session() {
    let (manager, _audit, _tmp) = temp_manager().await;
    manager.configure(PASSWORD, "192.168.1.50").await.unwrap();

    let phone = login(&manager, PASSWORD, "phone").await.unwrap();
    let laptop = login(&manager, PASSWORD, "laptop").await.unwrap();

    let fresh = manager
        .change_password(PASSWORD, "a brand new secret", "192.168.1.50", Some("laptop"))
        .await
        .unwrap();

    assert!(manager.validate_session(&phone).is_none());
    assert!(manager.validate_session(&laptop).is_none());
    assert!(manager.validate_session(&fresh).is_some());
    assert_eq!(manager.session_count(), 1);

    assert!(login(&manager, PASSWORD, "phone").await.is_none());
    assert!(login(&manager, "a brand new secret", "phone").await.is_some());
}

#[tokio::test]
async fn test_change_password_with_wrong_current_keeps_sessions() {
    let (manager, _audit, _tmp) = temp_manager().await;
    manager.configure(PASSWORD, "192.168.1.50").await.unwrap();
    let token = login(&manager, PASSWORD, "phone").await.unwrap();

    let err = manager
        .change_password("not the password", "another secret!", "192.168.1.50", None)
        .await
        .unwrap_err();
    assert!(matches!(err, VestibuleError::InvalidCredentials));
    assert!(manager.validate_session(&token).is_some());
}

#[tokio::test]
async fn test_change_password_rejects_weak_new_password() {
    let (manager, _audit, _tmp) = temp_manager().await;
    manager.configure(PASSWORD, "192.168.1.50").await.unwrap();

    let err = manager
        .change_password(PASSWORD, "tiny", "192.168.1.50", None)
        .await
        .unwrap_err();
    assert!(matches!(err, VestibuleError::InvalidPassword(_)));
}

#[tokio::test]
async fn test_concurrent_setup_configures_once() {
    let (manager, _audit, _tmp) = temp_manager().await;

    let a = {
        let m = Arc::clone(&manager);
        tokio::spawn(async move { m.configure("first password!", "10.0.0.1").await })
    };
    let b = {
        let m = Arc::clone(&manager);
        tokio::spawn(async move { m.configure("second password", "10.0.0.2").await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(VestibuleError::AlreadyConfigured))));
}

#[tokio::test]
async fn test_password_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let (manager, _audit) = manager_at(tmp.path()).await;
        manager.configure(PASSWORD, "192.168.1.50").await.unwrap();
    }

    let (manager, _audit) = manager_at(tmp.path()).await;
    assert!(manager.is_configured());
    assert!(login(&manager, PASSWORD, "phone").await.is_some());

    let store = FileCredentialStore::new(tmp.path().join("auth")).await.unwrap();
    let stored = store.load().await.unwrap().unwrap();
    assert!(stored.password_hash.starts_with("$argon2id$"));
    assert!(!stored.password_hash.contains(PASSWORD));
}

#[tokio::test]
async fn test_auth_events_reach_audit_log() {
    let (manager, audit, _tmp) = temp_manager().await;
    manager.configure(PASSWORD, "192.168.1.50").await.unwrap();
    assert!(login(&manager, "wrong password", "phone").await.is_none());
    let token = login(&manager, PASSWORD, "phone").await.unwrap();
    manager.invalidate_session(&token, "192.168.1.50");

    audit.flush().await;
    let contents = tokio::fs::read_to_string(audit.path()).await.unwrap();
    for event in [
        "password_configured",
        "login_failure",
        "login_success",
        "logout",
    ] {
        assert!(contents.contains(event), "missing {event}");
    }
    assert!(!contents.contains(&token));
}
