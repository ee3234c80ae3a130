//! Core types and error definitions for the Vestibule gateway.
//!
//! This crate provides the error taxonomy shared across all Vestibule crates.
//! Every failure the gateway can surface to a caller maps onto exactly one
//! [`VestibuleError`] variant, and each variant has a fixed HTTP status and a
//! stable machine-readable code.
//!
//! # Main types
//!
//! - [`VestibuleError`]: Unified error enum for all Vestibule subsystems.
//! - [`VestibuleResult`]: Convenience alias for `Result<T, VestibuleError>`.
//! - [`ErrorClass`]: Coarse classification used for logging and status mapping.

/// Error taxonomy.
pub mod error;

pub use error::{ErrorClass, VestibuleError, VestibuleResult};
