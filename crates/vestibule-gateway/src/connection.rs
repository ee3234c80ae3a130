use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::info;
use uuid::Uuid;
use vestibule_core::{VestibuleError, VestibuleResult};

#[derive(Debug)]
struct TunnelInfo {
    id: Uuid,
    path: String,
    client_ip: String,
    created_at: DateTime<Utc>,
}

/// Tracks active tunnels and enforces the concurrency cap.
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<Uuid, TunnelInfo>>,
    max_connections: usize,
    root: CancellationToken,
}

impl TunnelRegistry {
    /// `root` cancels every tunnel at once; pass a child of the gateway's
    /// shutdown token.
    pub fn new(max_connections: usize, root: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            tunnels: Mutex::new(HashMap::new()),
            max_connections,
            root,
        })
    }

    /// Claim a slot. The slot is released when the returned guard drops.
    pub fn try_register(
        self: &Arc<Self>,
        path: &str,
        client_ip: &str,
    ) -> VestibuleResult<TunnelGuard> {
        if self.root.is_cancelled() {
            return Err(VestibuleError::UpstreamUnavailable(
                "gateway is shutting down".into(),
            ));
        }

        let mut tunnels = self.tunnels.lock();
        if tunnels.len() >= self.max_connections {
            return Err(VestibuleError::CapacityExceeded {
                limit: self.max_connections,
            });
        }

        let info = TunnelInfo {
            id: Uuid::new_v4(),
            path: path.to_string(),
            client_ip: client_ip.to_string(),
            created_at: Utc::now(),
        };
        let id = info.id;
        tunnels.insert(id, info);
        let active = tunnels.len();
        drop(tunnels);

        info!(tunnel_id = %id, path, client_ip, active, "Tunnel opened");
        Ok(TunnelGuard {
            registry: Arc::clone(self),
            id,
            cancel: self.root.child_token(),
        })
    }

    /// Number of tunnels currently open.
    pub fn active_count(&self) -> usize {
        self.tunnels.lock().len()
    }

    /// Configured tunnel cap.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Force every tunnel to close and refuse new ones.
    pub fn close_all(&self) {
        let active = self.active_count();
        self.root.cancel();
        info!(active, "Closing all tunnels");
    }

    fn remove(&self, id: Uuid) -> Option<TunnelInfo> {
        self.tunnels.lock().remove(&id)
    }
}

/// Holds a tunnel slot. Dropping it cancels the tunnel and frees the slot;
/// dropping twice is impossible, so removal happens exactly once.
pub struct TunnelGuard {
    registry: Arc<TunnelRegistry>,
    id: Uuid,
    cancel: CancellationToken,
}

impl TunnelGuard {
    /// Registry id of this tunnel.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolves when the tunnel is told to close.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(info) = self.registry.remove(self.id) {
            let lifetime_secs = (Utc::now() - info.created_at).num_seconds();
            info!(
                tunnel_id = %info.id,
                path = %info.path,
                client_ip = %info.client_ip,
                lifetime_secs,
                "Tunnel released"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_enforced_and_freed() {
        let registry = TunnelRegistry::new(2, CancellationToken::new());
        let a = registry.try_register("/ws/a", "127.0.0.1").unwrap();
        let _b = registry.try_register("/ws/b", "127.0.0.1").unwrap();

        let err = registry.try_register("/ws/c", "127.0.0.1").err().unwrap();
        assert!(matches!(err, VestibuleError::CapacityExceeded { limit: 2 }));

        drop(a);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.try_register("/ws/c", "127.0.0.1").is_ok());
    }

    #[tokio::test]
    async fn test_close_all_cancels_and_refuses() {
        let registry = TunnelRegistry::new(4, CancellationToken::new());
        let guard = registry.try_register("/ws/a", "127.0.0.1").unwrap();

        registry.close_all();
        guard.cancelled().await;
        assert!(registry.try_register("/ws/b", "127.0.0.1").is_err());

        drop(guard);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_guard_ids_are_distinct() {
        let registry = TunnelRegistry::new(4, CancellationToken::new());
        let a = registry.try_register("/ws/a", "127.0.0.1").unwrap();
        let b = registry.try_register("/ws/a", "127.0.0.1").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.active_count(), 2);
    }
}
