//! Front door of the Vestibule gateway.
//!
//! Terminates client HTTP, authenticates sessions, rate-limits, and forwards
//! everything under `/api/*` it does not answer itself to the upstream
//! runtime. WebSocket upgrades bypass the HTTP middleware and are spliced to
//! the upstream as raw byte tunnels with ping/pong liveness.
//!
//! # Main types
//!
//! - [`GatewayServer`]: Router construction and the serve loop.
//! - [`GatewayState`]: Shared state reachable from every handler.
//! - [`GatewayConfig`]: Upstream, limiter, session and tunnel settings.
//! - [`ReverseProxy`]: Request forwarding with header hygiene.
//! - [`TunnelRegistry`]: Live WebSocket tunnels and the connection cap.

/// Auth route handlers.
pub mod auth;
/// Gateway configuration.
pub mod config;
/// Live tunnel bookkeeping.
pub mod connection;
/// HTTP error mapping.
pub mod error;
/// WebSocket frame boundary scanning.
pub mod frame;
/// Auth, rate-limit and upgrade middleware.
pub mod middleware;
/// Exposed port registry.
pub mod ports;
/// HTTP reverse proxy.
pub mod proxy;
/// Router and serve loop.
pub mod server;
/// Shared handler state.
pub mod state;
/// WebSocket tunnel.
pub mod tunnel;

pub use config::{GatewayConfig, TunnelConfig, UpstreamConfig};
pub use connection::{TunnelGuard, TunnelRegistry};
pub use error::{ApiError, ApiJson};
pub use ports::{ExposedPort, PortRegistry};
pub use proxy::ReverseProxy;
pub use server::GatewayServer;
pub use state::GatewayState;
