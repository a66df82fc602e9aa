//! # Status Reporting
//!
//! Every sync outcome ends up here as a [`VvmEvent`]. The reporter folds it
//! into the account's persisted [`VoicemailStatus`] and pushes the result to
//! the host through a [`StatusEmitter`].
//!
//! ```text
//! Orchestrator ──event──► StatusReporter ──save──► StatusRepository
//!                                │
//!                                └──emit──► StatusEmitter (host UI, logs)
//! ```
//!
//! Reporting is best effort: a status write that fails is logged and does
//! not change the outcome of the task that reported it.

use std::sync::Arc;
use tracing::{debug, warn};

use vvm_core::{AccountHandle, Quota, VoicemailStatus, VvmEvent};
use vvm_db::Database;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Emitter Trait
// =============================================================================

/// Receives status changes on the host side.
pub trait StatusEmitter: Send + Sync {
    /// Called after every persisted status change.
    fn emit_status(&self, status: &VoicemailStatus);

    /// Called when a task fails.
    fn emit_error(&self, account: &AccountHandle, message: &str, retryable: bool);
}

/// Emitter that drops everything.
pub struct NoOpEmitter;

impl StatusEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &VoicemailStatus) {}
    fn emit_error(&self, _account: &AccountHandle, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Reporter
// =============================================================================

/// Writes status events for accounts.
#[derive(Clone)]
pub struct StatusReporter {
    db: Arc<Database>,
    emitter: Arc<dyn StatusEmitter>,
}

impl StatusReporter {
    pub fn new(db: Arc<Database>, emitter: Arc<dyn StatusEmitter>) -> Self {
        StatusReporter { db, emitter }
    }

    /// Current status of an account, or the initial one if never written.
    pub async fn status(&self, account: &AccountHandle) -> SyncResult<VoicemailStatus> {
        Ok(self
            .db
            .status()
            .get(account)
            .await?
            .unwrap_or_else(|| VoicemailStatus::new(account.clone())))
    }

    /// Applies an event to the account status.
    pub async fn report(&self, account: &AccountHandle, event: VvmEvent) {
        let result = self
            .update(account, |status| status.apply_event(event))
            .await;

        match result {
            Ok(status) => {
                debug!(account = %account, event = %event, "Status event");
                self.emitter.emit_status(&status);
            }
            Err(e) => warn!(account = %account, event = %event, ?e, "Failed to write status"),
        }
    }

    /// Reports the status event of a failed task, then notifies the host.
    pub async fn report_error(&self, account: &AccountHandle, error: &SyncError) {
        if let Some(event) = error.status_event() {
            self.report(account, event).await;
        }
        self.emitter
            .emit_error(account, &error.to_string(), error.is_retryable());
    }

    /// Persists a freshly queried quota.
    pub async fn update_quota(&self, account: &AccountHandle, quota: Quota) {
        match self.update(account, |status| status.set_quota(quota)).await {
            Ok(status) => {
                debug!(
                    account = %account,
                    occupied = quota.occupied,
                    total = quota.total,
                    "Quota updated"
                );
                self.emitter.emit_status(&status);
            }
            Err(e) => warn!(account = %account, ?e, "Failed to write quota"),
        }
    }

    /// Marks the account as no longer a voicemail source.
    pub async fn disable(&self, account: &AccountHandle) {
        self.report(account, VvmEvent::ConfigDisabled).await;
    }

    async fn update(
        &self,
        account: &AccountHandle,
        change: impl FnOnce(&mut VoicemailStatus),
    ) -> SyncResult<VoicemailStatus> {
        let mut status = self.status(account).await?;
        change(&mut status);
        self.db.status().save(&status).await?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vvm_core::{ConfigurationState, DataChannelState};
    use vvm_db::DbConfig;

    #[derive(Default)]
    struct RecordingEmitter {
        statuses: Mutex<Vec<VoicemailStatus>>,
        errors: Mutex<Vec<(String, bool)>>,
    }

    impl StatusEmitter for RecordingEmitter {
        fn emit_status(&self, status: &VoicemailStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }

        fn emit_error(&self, _account: &AccountHandle, message: &str, retryable: bool) {
            self.errors
                .lock()
                .unwrap()
                .push((message.to_string(), retryable));
        }
    }

    async fn reporter() -> (StatusReporter, Arc<RecordingEmitter>) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let emitter = Arc::new(RecordingEmitter::default());
        (StatusReporter::new(db, emitter.clone()), emitter)
    }

    #[tokio::test]
    async fn test_report_persists_and_emits() {
        let (reporter, emitter) = reporter().await;
        let account = AccountHandle::new("sim-1");

        reporter
            .report(&account, VvmEvent::ConfigActivationSucceeded)
            .await;
        reporter
            .report(&account, VvmEvent::DataCannotEstablishConnection)
            .await;

        let status = reporter.status(&account).await.unwrap();
        assert_eq!(status.configuration_state, ConfigurationState::Ok);
        assert_eq!(
            status.data_channel_state,
            DataChannelState::ServerConnectionError
        );
        assert_eq!(
            status.last_event.as_deref(),
            Some("data_cannot_establish_connection")
        );
        assert_eq!(emitter.statuses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_report_error_maps_event() {
        let (reporter, emitter) = reporter().await;
        let account = AccountHandle::new("sim-1");

        reporter
            .report_error(&account, &SyncError::InvalidPort("14x3".into()))
            .await;

        let status = reporter.status(&account).await.unwrap();
        assert_eq!(status.data_channel_state, DataChannelState::BadConfiguration);

        let errors = emitter.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].1);
    }

    #[tokio::test]
    async fn test_quota_and_disable() {
        let (reporter, _) = reporter().await;
        let account = AccountHandle::new("sim-2");

        reporter.update_quota(&account, Quota::new(30, 40)).await;
        reporter.disable(&account).await;

        let status = reporter.status(&account).await.unwrap();
        assert_eq!(status.quota(), Some(Quota::new(30, 40)));
        assert_eq!(status.configuration_state, ConfigurationState::Disabled);
    }
}
