//! Password authentication and login sessions for the Vestibule gateway.

/// Session lifecycle: configure, login, validate, revoke.
pub mod manager;
/// The session record and its settings.
pub mod session;
/// Persistence for the password credential.
pub mod store;

pub use manager::{LoginOutcome, SessionManager};
pub use session::{Session, SessionConfig, SessionInfo};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoredCredential};
