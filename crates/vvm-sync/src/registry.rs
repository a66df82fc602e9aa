//! # Source Registry
//!
//! Accounts currently acting as visual voicemail sources, each with a
//! listener that requests a sync when the SIM regains service.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  add_source(sim-1)                                                      │
//! │    └── spawn ServiceStateListener ──watch──► NetworkManager            │
//! │              out of service → in service  ⇒  enqueue full_sync         │
//! │                                                                         │
//! │  remove_source(sim-1)                                                   │
//! │    1. status → ConfigDisabled                                           │
//! │    2. stop the listener                                                 │
//! │    3. forget the account, drop its pending tasks                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One registry is built by the composition root and shared by handle;
//! there is no global instance.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vvm_core::{AccountHandle, SyncAction};

use crate::network::{NetworkManager, NetworkState};
use crate::scheduler::{SchedulerHandle, SyncTask};
use crate::status::StatusReporter;

// =============================================================================
// Service State Listener
// =============================================================================

/// Requests a full sync when the cellular network comes back.
pub struct ServiceStateListener {
    handle: JoinHandle<()>,
}

impl ServiceStateListener {
    pub fn spawn(
        account: AccountHandle,
        mut state_rx: watch::Receiver<NetworkState>,
        scheduler: SchedulerHandle,
    ) -> Self {
        let mut in_service = state_rx.borrow_and_update().in_service();

        let handle = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let now_in_service = state_rx.borrow_and_update().in_service();
                if now_in_service && !in_service {
                    info!(account = %account, "Service regained, requesting sync");
                    let task = SyncTask::new(account.clone(), SyncAction::FullSync);
                    if let Err(e) = scheduler.enqueue(task).await {
                        warn!(account = %account, ?e, "Scheduler gone, listener stopping");
                        break;
                    }
                }
                in_service = now_in_service;
            }
        });

        ServiceStateListener { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ServiceStateListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Thread-safe set of active voicemail sources.
#[derive(Clone)]
pub struct SourceRegistry {
    sources: Arc<RwLock<HashMap<AccountHandle, ServiceStateListener>>>,
    network: NetworkManager,
    scheduler: SchedulerHandle,
    reporter: StatusReporter,
}

impl SourceRegistry {
    pub fn new(network: NetworkManager, scheduler: SchedulerHandle, reporter: StatusReporter) -> Self {
        SourceRegistry {
            sources: Arc::new(RwLock::new(HashMap::new())),
            network,
            scheduler,
            reporter,
        }
    }

    /// Registers an account. Returns false if it already was.
    pub async fn add_source(&self, account: &AccountHandle) -> bool {
        let mut sources = self.sources.write().await;
        if sources.contains_key(account) {
            debug!(account = %account, "Source already registered");
            return false;
        }

        let listener = ServiceStateListener::spawn(
            account.clone(),
            self.network.subscribe(),
            self.scheduler.clone(),
        );
        sources.insert(account.clone(), listener);
        info!(account = %account, sources = sources.len(), "Source added");
        true
    }

    /// Unregisters an account. Returns false if it was not registered.
    pub async fn remove_source(&self, account: &AccountHandle) -> bool {
        if !self.is_registered(account).await {
            return false;
        }

        self.reporter.disable(account).await;

        let removed = {
            let mut sources = self.sources.write().await;
            if let Some(listener) = sources.get(account) {
                listener.stop();
            }
            sources.remove(account).is_some()
        };

        if let Err(e) = self.scheduler.cancel_account(account).await {
            warn!(account = %account, ?e, "Could not cancel pending tasks");
        }

        info!(account = %account, "Source removed");
        removed
    }

    pub async fn is_registered(&self, account: &AccountHandle) -> bool {
        self.sources.read().await.contains_key(account)
    }

    /// Registered accounts, sorted.
    pub async fn accounts(&self) -> Vec<AccountHandle> {
        let mut accounts: Vec<_> = self.sources.read().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Drops every source and its listener without touching status.
    pub async fn clear(&self) {
        let mut sources = self.sources.write().await;
        let count = sources.len();
        sources.clear();
        debug!(count, "Registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::NoOpEmitter;
    use crate::testing::{memory_db, recording_scheduler, RecordingRunner};
    use vvm_core::ConfigurationState;

    struct Fixture {
        registry: SourceRegistry,
        network: NetworkManager,
        reporter: StatusReporter,
        runner: Arc<RecordingRunner>,
    }

    async fn fixture() -> Fixture {
        let network = NetworkManager::new(NetworkState::online());
        let (handle, runner) = recording_scheduler();
        let reporter = StatusReporter::new(memory_db().await, Arc::new(NoOpEmitter));
        Fixture {
            registry: SourceRegistry::new(network.clone(), handle, reporter.clone()),
            network,
            reporter,
            runner,
        }
    }

    #[tokio::test]
    async fn test_add_and_remove_are_idempotent() {
        let f = fixture().await;
        let account = AccountHandle::new("sim-1");

        assert!(f.registry.add_source(&account).await);
        assert!(!f.registry.add_source(&account).await);
        assert_eq!(f.registry.accounts().await, vec![account.clone()]);

        assert!(f.registry.remove_source(&account).await);
        assert!(!f.registry.remove_source(&account).await);
        assert!(!f.registry.is_registered(&account).await);

        let status = f.reporter.status(&account).await.unwrap();
        assert_eq!(status.configuration_state, ConfigurationState::Disabled);
    }

    #[tokio::test]
    async fn test_service_regained_requests_sync() {
        let f = fixture().await;
        let account = AccountHandle::new("sim-1");
        f.network.set_state(NetworkState::offline());
        f.registry.add_source(&account).await;

        f.network.set_state(NetworkState::online());

        assert!(f.runner.wait_for(1).await);
        assert_eq!(f.runner.actions(), vec![(account, SyncAction::FullSync)]);
    }

    #[tokio::test]
    async fn test_removed_source_stops_listening() {
        let f = fixture().await;
        let account = AccountHandle::new("sim-1");
        f.network.set_state(NetworkState::offline());
        f.registry.add_source(&account).await;
        f.registry.remove_source(&account).await;

        f.network.set_state(NetworkState::online());

        assert!(!f.runner.wait_for(1).await);
    }

    #[tokio::test]
    async fn test_wifi_change_alone_is_not_regained_service() {
        let f = fixture().await;
        let account = AccountHandle::new("sim-1");
        f.registry.add_source(&account).await;

        f.network.set_state(NetworkState {
            cellular: true,
            wifi: false,
            roaming: true,
        });

        assert!(!f.runner.wait_for(1).await);
    }

    #[tokio::test]
    async fn test_clear_drops_listeners_without_status() {
        let f = fixture().await;
        let account = AccountHandle::new("sim-1");
        f.network.set_state(NetworkState::offline());
        f.registry.add_source(&account).await;

        f.registry.clear().await;
        f.network.set_state(NetworkState::online());

        assert!(f.registry.accounts().await.is_empty());
        assert!(!f.runner.wait_for(1).await);
        let status = f.reporter.status(&account).await.unwrap();
        assert_ne!(status.configuration_state, ConfigurationState::Disabled);
    }
}
