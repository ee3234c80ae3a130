use crate::error::{ApiError, ApiJson};
use crate::state::GatewayState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::info;
use vestibule_core::{VestibuleError, VestibuleResult};

/// A runtime port the client has asked to reach through the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedPort {
    /// Runtime port number.
    pub port: u16,
    /// Optional display label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// When the port was exposed.
    pub created_at: DateTime<Utc>,
}

/// In-memory set of exposed ports.
#[derive(Default)]
pub struct PortRegistry {
    ports: RwLock<BTreeMap<u16, ExposedPort>>,
    own_port: AtomicU16,
}

impl PortRegistry {
    /// An empty registry with no own port set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the gateway's listen port so it cannot be exposed.
    pub fn set_own_port(&self, port: u16) {
        self.own_port.store(port, Ordering::Relaxed);
    }

    /// Sorted by port number.
    pub fn list(&self) -> Vec<ExposedPort> {
        self.ports.read().values().cloned().collect()
    }

    /// Register `port`. Rejects out-of-range ports, the gateway's own port and duplicates.
    pub fn expose(&self, port: u32, label: Option<String>) -> VestibuleResult<ExposedPort> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                VestibuleError::BadRequest(format!("port must be between 1 and 65535, got {port}"))
            })?;
        if port == self.own_port.load(Ordering::Relaxed) {
            return Err(VestibuleError::BadRequest(format!(
                "port {port} is the gateway's own listen port"
            )));
        }
        let label = label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());

        let mut ports = self.ports.write();
        if ports.contains_key(&port) {
            return Err(VestibuleError::Conflict(format!(
                "port {port} is already exposed"
            )));
        }
        let exposed = ExposedPort {
            port,
            label,
            created_at: Utc::now(),
        };
        ports.insert(port, exposed.clone());
        info!(port, "Port exposed");
        Ok(exposed)
    }

    /// Forget `port`, or `NotFound` if it was never exposed.
    pub fn remove(&self, port: u16) -> VestibuleResult<()> {
        match self.ports.write().remove(&port) {
            Some(_) => {
                info!(port, "Port removed");
                Ok(())
            }
            None => Err(VestibuleError::NotFound(format!("port {port}"))),
        }
    }
}

/// Body of `POST /api/ports`.
#[derive(Deserialize)]
pub struct ExposeRequest {
    /// Wider than `u16` so out-of-range values reach validation.
    pub port: u32,
    /// Optional display label.
    #[serde(default)]
    pub label: Option<String>,
}

/// `GET /api/ports`
pub async fn list_ports(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "ports": state.ports.list() }))
}

/// `POST /api/ports`
pub async fn expose_port(
    State(state): State<Arc<GatewayState>>,
    ApiJson(req): ApiJson<ExposeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let exposed = state.ports.expose(req.port, req.label)?;
    Ok((StatusCode::CREATED, Json(exposed)))
}

/// `DELETE /api/ports/{port}`
pub async fn remove_port(
    State(state): State<Arc<GatewayState>>,
    Path(port): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let port: u16 = port
        .parse()
        .map_err(|_| VestibuleError::BadRequest(format!("'{port}' is not a port number")))?;
    state.ports.remove(port)?;
    Ok(Json(serde_json::json!({ "success": true })))
}
