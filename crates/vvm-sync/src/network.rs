//! # Network Lease
//!
//! Grants a task exclusive use of a carrier-appropriate network for the
//! duration of one sync operation.
//!
//! ## Lease Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  host ──set_state()──► watch<NetworkState> ◄──subscribe()── listeners   │
//! │                              │                                          │
//! │                              ▼                                          │
//! │  task ──acquire(request, timeout)──► wait until state satisfies request │
//! │            │                              │                             │
//! │            │ timeout                      │ granted                     │
//! │            ▼                              ▼                             │
//! │   SyncError::NetworkUnavailable     NetworkLease (active += 1)          │
//! │                                           │                             │
//! │                                     drop / release()                    │
//! │                                           │                             │
//! │                                     active -= 1                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The lease is released on every exit path of the task that holds it
//! because release happens in `Drop`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Network State
// =============================================================================

/// Kind of network a lease was granted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Cellular,
    Wifi,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkKind::Cellular => write!(f, "cellular"),
            NetworkKind::Wifi => write!(f, "wifi"),
        }
    }
}

/// Connectivity as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkState {
    /// Cellular data is usable (the SIM is in service).
    pub cellular: bool,

    /// Wi-Fi is usable.
    pub wifi: bool,

    /// The cellular network is a roaming network.
    pub roaming: bool,
}

impl NetworkState {
    /// Everything up, not roaming.
    pub fn online() -> Self {
        NetworkState {
            cellular: true,
            wifi: true,
            roaming: false,
        }
    }

    /// Nothing usable.
    pub fn offline() -> Self {
        NetworkState::default()
    }

    /// Returns true if the SIM is in service.
    pub fn in_service(&self) -> bool {
        self.cellular
    }

    /// Picks the network a request would be granted, if any.
    ///
    /// Wi-Fi is preferred unless the carrier requires cellular data.
    pub fn grant(&self, request: NetworkRequest) -> Option<NetworkKind> {
        if request.cellular_required {
            return self.cellular.then_some(NetworkKind::Cellular);
        }
        if self.wifi {
            Some(NetworkKind::Wifi)
        } else if self.cellular {
            Some(NetworkKind::Cellular)
        } else {
            None
        }
    }
}

/// What a task needs from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkRequest {
    /// Only cellular data is acceptable.
    pub cellular_required: bool,
}

// =============================================================================
// Network Manager
// =============================================================================

/// Tracks connectivity and hands out leases.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct NetworkManager {
    state_tx: Arc<watch::Sender<NetworkState>>,
    active: Arc<AtomicUsize>,
}

impl NetworkManager {
    /// Creates a manager with an initial connectivity state.
    pub fn new(initial: NetworkState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        NetworkManager {
            state_tx: Arc::new(state_tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publishes a connectivity change.
    pub fn set_state(&self, state: NetworkState) {
        debug!(?state, "Network state changed");
        self.state_tx.send_replace(state);
    }

    /// Current connectivity.
    pub fn state(&self) -> NetworkState {
        *self.state_tx.borrow()
    }

    /// Subscribes to connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state_tx.subscribe()
    }

    /// Number of leases currently held.
    pub fn active_leases(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits for a network that satisfies `request`.
    ///
    /// ## Errors
    /// `SyncError::NetworkUnavailable` if nothing suitable shows up within
    /// `timeout`.
    pub async fn acquire(
        &self,
        request: NetworkRequest,
        timeout: Duration,
    ) -> SyncResult<NetworkLease> {
        let mut rx = self.subscribe();

        let granted = tokio::time::timeout(timeout, async {
            loop {
                let state = *rx.borrow_and_update();
                if let Some(kind) = state.grant(request) {
                    return Some((kind, kind == NetworkKind::Cellular && state.roaming));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        match granted {
            Ok(Some((kind, roaming))) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                let lease = NetworkLease {
                    id: Uuid::new_v4(),
                    kind,
                    roaming,
                    active: self.active.clone(),
                };
                info!(lease = %lease.id, network = %kind, roaming, "Network acquired");
                Ok(lease)
            }
            Ok(None) | Err(_) => {
                warn!(
                    cellular_required = request.cellular_required,
                    timeout_secs = timeout.as_secs(),
                    "No network available"
                );
                Err(SyncError::NetworkUnavailable {
                    cellular_required: request.cellular_required,
                })
            }
        }
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        NetworkManager::new(NetworkState::online())
    }
}

// =============================================================================
// Network Lease
// =============================================================================

/// Exclusive use of a network by one task.
pub struct NetworkLease {
    id: Uuid,
    kind: NetworkKind,
    roaming: bool,
    active: Arc<AtomicUsize>,
}

impl NetworkLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    /// True if the lease was granted on a roaming cellular network.
    ///
    /// Wi-Fi is never considered roaming.
    pub fn is_roaming(&self) -> bool {
        self.roaming
    }

    /// Releases the lease explicitly.
    pub fn release(self) {}
}

impl Drop for NetworkLease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(lease = %self.id, "Network released");
    }
}

impl fmt::Debug for NetworkLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkLease")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("roaming", &self.roaming)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_prefers_wifi() {
        let state = NetworkState::online();
        assert_eq!(state.grant(NetworkRequest::default()), Some(NetworkKind::Wifi));
        assert_eq!(
            state.grant(NetworkRequest { cellular_required: true }),
            Some(NetworkKind::Cellular)
        );

        let wifi_only = NetworkState {
            wifi: true,
            ..Default::default()
        };
        assert_eq!(wifi_only.grant(NetworkRequest { cellular_required: true }), None);
    }

    #[tokio::test]
    async fn test_lease_released_on_drop() {
        let manager = NetworkManager::default();
        let lease = manager
            .acquire(NetworkRequest::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(manager.active_leases(), 1);
        assert!(!lease.is_roaming());

        drop(lease);
        assert_eq!(manager.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_wifi_lease_is_never_roaming() {
        let manager = NetworkManager::new(NetworkState {
            cellular: true,
            wifi: true,
            roaming: true,
        });

        let lease = manager
            .acquire(NetworkRequest::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lease.kind(), NetworkKind::Wifi);
        assert!(!lease.is_roaming());
        assert!(format!("{:?}", lease).contains("roaming: false"));

        let cellular = manager
            .acquire(NetworkRequest { cellular_required: true }, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(cellular.is_roaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let manager = NetworkManager::new(NetworkState {
            wifi: true,
            ..Default::default()
        });

        let err = manager
            .acquire(NetworkRequest { cellular_required: true }, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::NetworkUnavailable { cellular_required: true }
        ));
        assert_eq!(manager.active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_network() {
        let manager = NetworkManager::new(NetworkState::offline());

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire(NetworkRequest::default(), Duration::from_secs(30))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        manager.set_state(NetworkState {
            cellular: true,
            roaming: true,
            ..Default::default()
        });

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.kind(), NetworkKind::Cellular);
        assert!(lease.is_roaming());
    }
}
