//! # Account Activation
//!
//! Turns an enabled account into a registered voicemail source.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  activate(sim-1)                                                        │
//! │    1. ConfigActivating                                                  │
//! │    2. credentials: config seed (saved) or credential store              │
//! │         none          ──► ConfigNotConfigured                           │
//! │         malformed     ──► DataInvalidPort / ConfigNotConfigured         │
//! │    3. SourceRegistry::add_source (service-state listener)               │
//! │    4. ConfigActivationSucceeded                                         │
//! │    5. enqueue full_sync                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tracing::{debug, info, warn};

use vvm_core::validation::validate_command_argument;
use vvm_core::{AccountHandle, ImapCredentials, SyncAction, VvmEvent};
use vvm_db::Database;

use crate::config::VvmConfig;
use crate::error::{SyncError, SyncResult};
use crate::registry::SourceRegistry;
use crate::scheduler::{SchedulerHandle, SyncTask};
use crate::status::StatusReporter;

/// Registers accounts whose credentials check out.
#[derive(Clone)]
pub struct Activator {
    config: Arc<VvmConfig>,
    db: Arc<Database>,
    registry: SourceRegistry,
    reporter: StatusReporter,
    scheduler: SchedulerHandle,
}

impl Activator {
    pub fn new(
        config: Arc<VvmConfig>,
        db: Arc<Database>,
        registry: SourceRegistry,
        reporter: StatusReporter,
        scheduler: SchedulerHandle,
    ) -> Self {
        Activator {
            config,
            db,
            registry,
            reporter,
            scheduler,
        }
    }

    /// Activates an account. Returns false if it was not activated; the
    /// reason is already in its status.
    pub async fn activate(&self, account: &AccountHandle) -> SyncResult<bool> {
        if !self.config.is_enabled(account) {
            debug!(account = %account, "Account not enabled, skipping activation");
            return Ok(false);
        }

        info!(account = %account, "Activating voicemail source");
        self.reporter.report(account, VvmEvent::ConfigActivating).await;

        let Some(credentials) = self.credentials(account).await? else {
            warn!(account = %account, "No credentials, account is not configured");
            self.reporter
                .report(account, VvmEvent::ConfigNotConfigured)
                .await;
            return Ok(false);
        };

        if let Err(e) = check_credentials(&credentials) {
            warn!(account = %account, error = %e, "Stored credentials are malformed");
            self.reporter.report_error(account, &e).await;
            self.reporter
                .report(account, VvmEvent::ConfigNotConfigured)
                .await;
            return Ok(false);
        }

        self.registry.add_source(account).await;
        self.reporter
            .report(account, VvmEvent::ConfigActivationSucceeded)
            .await;

        self.scheduler
            .enqueue(SyncTask::new(account.clone(), SyncAction::FullSync))
            .await?;

        info!(account = %account, "Voicemail source activated");
        Ok(true)
    }

    /// Credentials from the config file win and are written through to the
    /// credential store.
    async fn credentials(&self, account: &AccountHandle) -> SyncResult<Option<ImapCredentials>> {
        let store = self.db.credentials();

        if let Some(seed) = self
            .config
            .account(account)
            .and_then(|a| a.credentials.clone())
        {
            store.save(account, &seed).await?;
            return Ok(Some(seed));
        }

        Ok(store.get(account).await?)
    }
}

/// Checks everything a session needs before a connection is attempted.
fn check_credentials(credentials: &ImapCredentials) -> SyncResult<()> {
    credentials
        .port_number()
        .map_err(|_| SyncError::InvalidPort(credentials.port.clone()))?;
    validate_command_argument("username", &credentials.username)?;
    validate_command_argument("password", &credentials.password)?;
    validate_command_argument("server", &credentials.server)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;
    use crate::network::NetworkManager;
    use crate::status::NoOpEmitter;
    use crate::testing::{credentials, memory_db, recording_scheduler, RecordingRunner};
    use vvm_core::{ConfigurationState, DataChannelState};

    struct Fixture {
        activator: Activator,
        registry: SourceRegistry,
        reporter: StatusReporter,
        db: Arc<Database>,
        runner: Arc<RecordingRunner>,
    }

    async fn fixture(account: AccountConfig) -> Fixture {
        let db = memory_db().await;
        let (scheduler, runner) = recording_scheduler();
        let reporter = StatusReporter::new(db.clone(), Arc::new(NoOpEmitter));
        let registry = SourceRegistry::new(NetworkManager::default(), scheduler.clone(), reporter.clone());
        let config = Arc::new(VvmConfig {
            accounts: vec![account],
            ..Default::default()
        });

        Fixture {
            activator: Activator::new(config, db.clone(), registry.clone(), reporter.clone(), scheduler),
            registry,
            reporter,
            db,
            runner,
        }
    }

    fn account_config(credentials: Option<ImapCredentials>) -> AccountConfig {
        AccountConfig {
            id: "sim-1".into(),
            enabled: true,
            credentials,
            carrier: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_activation_registers_and_requests_sync() {
        let f = fixture(account_config(Some(credentials()))).await;
        let account = AccountHandle::new("sim-1");

        assert!(f.activator.activate(&account).await.unwrap());

        assert!(f.registry.is_registered(&account).await);
        let status = f.reporter.status(&account).await.unwrap();
        assert_eq!(status.configuration_state, ConfigurationState::Ok);
        assert_eq!(
            f.db.credentials().get(&account).await.unwrap(),
            Some(credentials())
        );

        assert!(f.runner.wait_for(1).await);
        assert_eq!(f.runner.actions(), vec![(account, SyncAction::FullSync)]);
    }

    #[tokio::test]
    async fn test_stored_credentials_are_used() {
        let f = fixture(account_config(None)).await;
        let account = AccountHandle::new("sim-1");
        f.db.credentials().save(&account, &credentials()).await.unwrap();

        assert!(f.activator.activate(&account).await.unwrap());
        assert!(f.registry.is_registered(&account).await);
    }

    #[tokio::test]
    async fn test_missing_credentials_leave_account_unconfigured() {
        let f = fixture(account_config(None)).await;
        let account = AccountHandle::new("sim-1");

        assert!(!f.activator.activate(&account).await.unwrap());

        assert!(!f.registry.is_registered(&account).await);
        let status = f.reporter.status(&account).await.unwrap();
        assert_eq!(status.configuration_state, ConfigurationState::NotConfigured);
        assert!(f.runner.actions().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_port_is_reported() {
        let mut bad = credentials();
        bad.port = "14x3".into();
        let f = fixture(account_config(Some(bad))).await;
        let account = AccountHandle::new("sim-1");

        assert!(!f.activator.activate(&account).await.unwrap());

        let status = f.reporter.status(&account).await.unwrap();
        assert_eq!(status.configuration_state, ConfigurationState::NotConfigured);
        assert_eq!(status.data_channel_state, DataChannelState::BadConfiguration);
        assert!(!f.registry.is_registered(&account).await);
    }

    #[tokio::test]
    async fn test_disabled_account_is_not_activated() {
        let mut config = account_config(Some(credentials()));
        config.enabled = false;
        let f = fixture(config).await;
        let account = AccountHandle::new("sim-1");

        assert!(!f.activator.activate(&account).await.unwrap());
        assert!(f.db.status().get(&account).await.unwrap().is_none());
    }
}
