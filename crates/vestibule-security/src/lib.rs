//! Security primitives for the Vestibule gateway.
//!
//! Provides the audit trail, request-volume rate limiting, brute-force
//! lockout, and password hashing used by the session manager and gateway.
//!
//! # Main types
//!
//! - [`AuditLog`]: Append-only audit trail, batched to disk.
//! - [`RateLimiter`]: Per-key window counter for request volume.
//! - [`LockoutTracker`]: Per-key failed-login counter with timed locks.
//! - [`PasswordHashing`]: Argon2id hashing and verification.

/// Audit logging module.
pub mod audit;
/// Failed-login lockout.
pub mod lockout;
/// Password hashing, policy, and token generation.
pub mod password;
/// Window-based rate limiting.
pub mod rate_limit;

pub use audit::{AuditConfig, AuditEntry, AuditEvent, AuditLog};
pub use lockout::{LockoutConfig, LockoutStatus, LockoutTracker, LoginAttempt};
pub use password::{HashingConfig, PasswordHashing};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
