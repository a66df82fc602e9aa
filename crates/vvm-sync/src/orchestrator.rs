//! # Sync Orchestrator
//!
//! Runs one scheduled task end to end.
//!
//! ## Task Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  STARTED                                                                │
//! │    │  not enabled ─────────────────────────────────► skip               │
//! │    │  not a registered source ──► enqueue activate ► skip               │
//! │    ▼                                                                    │
//! │  DataImapOperationStarted                                               │
//! │    │                                                                    │
//! │    ▼                                                                    │
//! │  NETWORK_ACQUIRED   (lease held until the task ends)                    │
//! │    │                                                                    │
//! │    ▼                                                                    │
//! │  SELECT INBOX                                                           │
//! │    │                                                                    │
//! │    ├── UPLOAD?    deleted + read batches                                │
//! │    ├── DOWNLOAD?  listing diff                                          │
//! │    ├── SINGLE?    one transcription (+ audio)                           │
//! │    ▼                                                                    │
//! │  QUOTA_UPDATED      best effort, auto-archive when over 75 %            │
//! │    ▼                                                                    │
//! │  COMPLETED ──► DataImapOperationCompleted                               │
//! │                                                                         │
//! │  FAILED is reachable from every step: the mailbox is closed and the    │
//! │  lease released. The error is written to status only on the task's     │
//! │  last attempt; earlier attempts are retried by the scheduler.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The orchestrator also serves the requests that bypass the scheduler:
//! on-demand audio fetch for playback and the carrier commands (PIN,
//! language, tutorial).

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use vvm_core::validation::{validate_language_code, validate_pin};
use vvm_core::{
    AccountHandle, ChangePinResult, ImapCredentials, Quota, SyncAction, VoicemailPayload,
    VoicemailStatus, VvmEvent, AUTO_ARCHIVE_THRESHOLD, INBOX,
};
use vvm_db::Database;

use crate::activation::Activator;
use crate::config::{CarrierConfig, VvmConfig};
use crate::error::{SyncError, SyncResult};
use crate::imap::{Flag, FolderMode, StructureOutcome};
use crate::mailbox::{ImapConnector, Mailbox, MailboxConnector};
use crate::network::{NetworkLease, NetworkManager, NetworkRequest};
use crate::reconcile::ReconciliationEngine;
use crate::registry::SourceRegistry;
use crate::scheduler::{SchedulerHandle, SyncTask, TaskRunner};
use crate::status::{NoOpEmitter, StatusReporter};

// =============================================================================
// Orchestrator
// =============================================================================

/// Entry point of every sync task.
pub struct SyncOrchestrator {
    config: Arc<VvmConfig>,
    db: Arc<Database>,
    network: NetworkManager,
    connector: Arc<dyn MailboxConnector>,
    registry: SourceRegistry,
    scheduler: SchedulerHandle,
    reporter: StatusReporter,
    activator: Activator,
}

impl SyncOrchestrator {
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    /// Status of an account as last reported.
    pub async fn status(&self, account: &AccountHandle) -> SyncResult<VoicemailStatus> {
        self.reporter.status(account).await
    }

    // =========================================================================
    // Sync Tasks
    // =========================================================================

    async fn sync(&self, task: &SyncTask) -> SyncResult<bool> {
        let account = &task.account;

        if !self.config.is_enabled(account) {
            info!(account = %account, "Visual voicemail disabled, skipping sync");
            return Ok(false);
        }

        if !self.registry.is_registered(account).await {
            info!(account = %account, "Account is not an active source, activating instead");
            self.scheduler
                .enqueue(SyncTask::new(account.clone(), SyncAction::Activate))
                .await?;
            return Ok(false);
        }

        match self.sync_pass(task).await {
            Ok(true) => {
                self.reporter
                    .report(account, VvmEvent::DataImapOperationCompleted)
                    .await;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) if !task.is_last_attempt() => {
                warn!(
                    task_id = %task.id,
                    account = %account,
                    retries_left = task.retries_left,
                    error = %e,
                    "Sync failed, status left for the last attempt"
                );
                Ok(false)
            }
            Err(e) => {
                error!(task_id = %task.id, account = %account, error = %e, "Sync failed");
                self.reporter.report_error(account, &e).await;
                Ok(false)
            }
        }
    }

    /// Runs the phases of one task between lease acquisition and release.
    async fn sync_pass(&self, task: &SyncTask) -> SyncResult<bool> {
        let account = &task.account;
        let carrier = self.config.carrier(account);

        self.reporter
            .report(account, VvmEvent::DataImapOperationStarted)
            .await;

        let credentials = self.credentials(account).await?;
        let lease = self.acquire(&carrier).await?;
        let prefetch = carrier.should_prefetch(lease.is_roaming());

        let mut mailbox = self.connector.connect(account, credentials, &carrier, &lease);
        let result = self
            .run_phases(task, mailbox.as_mut(), &carrier, prefetch)
            .await;

        mailbox.close().await;
        lease.release();
        result
    }

    async fn run_phases(
        &self,
        task: &SyncTask,
        mailbox: &mut dyn Mailbox,
        carrier: &CarrierConfig,
        prefetch: bool,
    ) -> SyncResult<bool> {
        let account = &task.account;

        if mailbox.open_folder(FolderMode::ReadWrite).await?.is_none() {
            return Err(SyncError::FolderUnavailable(INBOX.to_string()));
        }

        let engine = ReconciliationEngine::new(account.clone(), self.db.voicemails(), prefetch);
        let mut success = true;

        if task.action.includes_upload() {
            let report = engine.upload(mailbox).await?;
            info!(
                account = %account,
                deleted = report.deleted,
                marked_read = report.marked_read,
                "Upload finished"
            );
            success &= report.success;
        }

        if task.action.includes_download() {
            let report = engine.download(mailbox).await?;
            info!(
                account = %account,
                inserted = report.inserted,
                removed = report.removed,
                read_state_updated = report.read_state_updated,
                unresolved = report.unresolved,
                "Download finished"
            );
        }

        if task.action.is_single_voicemail() {
            let source_data = task.source_data.as_deref().ok_or_else(|| {
                SyncError::Internal(format!("{} task without a target", task.action))
            })?;
            if !engine.download_one(mailbox, source_data).await? {
                warn!(account = %account, uid = %source_data, "Voicemail to transcribe is gone");
            }
        }

        self.refresh_quota(account, mailbox, carrier).await;

        if !success {
            warn!(account = %account, "Some local changes were not accepted by the server");
        }
        Ok(success)
    }

    // =========================================================================
    // Quota & Archive
    // =========================================================================

    /// Re-queries quota after the phases. Failures here never fail the task.
    async fn refresh_quota(
        &self,
        account: &AccountHandle,
        mailbox: &mut dyn Mailbox,
        carrier: &CarrierConfig,
    ) {
        let quota = match mailbox.get_quota().await {
            Ok(Some(quota)) => quota,
            Ok(None) => {
                debug!(account = %account, "Server does not report quota");
                return;
            }
            Err(e) => {
                warn!(account = %account, error = %e, "Quota query failed");
                return;
            }
        };

        self.reporter.update_quota(account, quota).await;

        if carrier.archive_enabled && quota.is_above(AUTO_ARCHIVE_THRESHOLD) {
            self.auto_archive(account, mailbox, quota).await;
        }
    }

    /// Removes the oldest voicemails from the server, keeping them locally,
    /// until usage is back at the archive threshold.
    async fn auto_archive(&self, account: &AccountHandle, mailbox: &mut dyn Mailbox, quota: Quota) {
        let excess = quota.excess_over(AUTO_ARCHIVE_THRESHOLD);
        let store = self.db.voicemails();

        let oldest = match store.oldest_on_server(account, excess).await {
            Ok(oldest) if !oldest.is_empty() => oldest,
            Ok(_) => return,
            Err(e) => {
                warn!(account = %account, ?e, "Could not select voicemails to archive");
                return;
            }
        };

        let uids: Vec<String> = oldest.iter().map(|v| v.source_data.clone()).collect();
        let ids: Vec<i64> = oldest.iter().filter_map(|v| v.id).collect();

        if !mailbox.set_flags(&uids, Flag::Deleted, true).await {
            warn!(account = %account, count = uids.len(), "Server refused to delete archived voicemails");
            return;
        }
        if let Err(e) = store.mark_archived(&ids).await {
            warn!(account = %account, ?e, "Failed to mark voicemails archived");
            return;
        }

        info!(
            account = %account,
            archived = ids.len(),
            occupied = quota.occupied,
            total = quota.total,
            "Archived old voicemails"
        );

        if let Ok(Some(quota)) = mailbox.get_quota().await {
            self.reporter.update_quota(account, quota).await;
        }
    }

    // =========================================================================
    // On-Demand Fetch
    // =========================================================================

    /// Audio of one voicemail for playback, from the local cache or the
    /// server.
    ///
    /// Transient failures are retried up to `fetch.retry_count` attempts
    /// with exponential backoff.
    pub async fn fetch_voicemail(
        &self,
        account: &AccountHandle,
        source_data: &str,
    ) -> SyncResult<VoicemailPayload> {
        let store = self.db.voicemails();
        let stored = store.find_by_source_data(account, source_data).await?;
        let Some((id, cached)) = stored.and_then(|v| v.id.map(|id| (id, v.has_content))) else {
            return Err(SyncError::VoicemailNotFound(source_data.to_string()));
        };

        if cached {
            if let Some(payload) = store.payload(id).await? {
                debug!(account = %account, uid = %source_data, "Payload served from cache");
                return Ok(payload);
            }
        }

        let mut backoff = self.fetch_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.fetch_remote_payload(account, source_data).await {
                Ok(payload) => {
                    store.save_payload(id, &payload).await?;
                    info!(
                        account = %account,
                        uid = %source_data,
                        bytes = payload.data.len(),
                        attempt,
                        "Voicemail fetched"
                    );
                    return Ok(payload);
                }
                Err(e) if e.is_retryable() && attempt < self.config.fetch.retry_count => {
                    let Some(delay) = backoff.next_backoff() else {
                        self.reporter.report_error(account, &e).await;
                        return Err(e);
                    };
                    warn!(
                        account = %account,
                        uid = %source_data,
                        attempt,
                        ?delay,
                        error = %e,
                        "Voicemail fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(account = %account, uid = %source_data, attempt, error = %e, "Voicemail fetch failed");
                    self.reporter.report_error(account, &e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_remote_payload(
        &self,
        account: &AccountHandle,
        source_data: &str,
    ) -> SyncResult<VoicemailPayload> {
        let mut session = self.open_session(account).await?;
        let result = fetch_audio(session.mailbox.as_mut(), source_data).await;
        session.close().await;
        result
    }

    fn fetch_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.fetch.initial_backoff_ms),
            max_interval: Duration::from_secs(self.config.fetch.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    // =========================================================================
    // Carrier Commands
    // =========================================================================

    /// Changes the voicemail PIN.
    ///
    /// The new PIN is checked against the carrier's length rules first;
    /// a server rejection comes back as a [`ChangePinResult`], not an error.
    pub async fn change_pin(
        &self,
        account: &AccountHandle,
        old_pin: &str,
        new_pin: &str,
    ) -> SyncResult<ChangePinResult> {
        let carrier = self.config.carrier(account);
        validate_pin(new_pin, carrier.pin_min_length, carrier.pin_max_length)?;

        let mut session = self.open_session(account).await?;
        let result = session.mailbox.change_pin(old_pin, new_pin).await;
        session.close().await;

        match &result {
            Ok(outcome) => info!(account = %account, result = ?outcome, "PIN change answered"),
            Err(e) => self.reporter.report_error(account, e).await,
        }
        result
    }

    /// Changes the greeting language.
    pub async fn change_language(&self, account: &AccountHandle, language: &str) -> SyncResult<()> {
        validate_language_code(language)?;

        let mut session = self.open_session(account).await?;
        let result = session.mailbox.change_language(language).await;
        session.close().await;

        if let Err(e) = &result {
            self.reporter.report_error(account, e).await;
        }
        result
    }

    /// Dismisses the new-user tutorial.
    pub async fn close_tutorial(&self, account: &AccountHandle) -> SyncResult<()> {
        let mut session = self.open_session(account).await?;
        let result = session.mailbox.close_tutorial().await;
        session.close().await;

        if let Err(e) = &result {
            self.reporter.report_error(account, e).await;
        }
        result
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn credentials(&self, account: &AccountHandle) -> SyncResult<ImapCredentials> {
        self.db
            .credentials()
            .get(account)
            .await?
            .ok_or_else(|| SyncError::MissingCredentials(account.to_string()))
    }

    async fn acquire(&self, carrier: &CarrierConfig) -> SyncResult<NetworkLease> {
        let request = NetworkRequest {
            cellular_required: carrier.cellular_data_required,
        };
        self.network
            .acquire(request, self.config.acquire_timeout())
            .await
    }

    /// Lease plus mailbox for a request outside the scheduler. Failures to
    /// get this far are reported.
    async fn open_session(&self, account: &AccountHandle) -> SyncResult<Session> {
        let carrier = self.config.carrier(account);

        let opened = async {
            let credentials = self.credentials(account).await?;
            let lease = self.acquire(&carrier).await?;
            Ok::<_, SyncError>((credentials, lease))
        }
        .await;

        match opened {
            Ok((credentials, lease)) => {
                let mailbox = self.connector.connect(account, credentials, &carrier, &lease);
                Ok(Session { mailbox, lease })
            }
            Err(e) => {
                self.reporter.report_error(account, &e).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl TaskRunner for SyncOrchestrator {
    async fn run(&self, task: &SyncTask) -> SyncResult<bool> {
        match task.action {
            SyncAction::Activate => self.activator.activate(&task.account).await,
            _ => self.sync(task).await,
        }
    }
}

/// A mailbox and the lease it runs over.
struct Session {
    mailbox: Box<dyn Mailbox>,
    lease: NetworkLease,
}

impl Session {
    async fn close(mut self) {
        self.mailbox.close().await;
        self.lease.release();
    }
}

async fn fetch_audio(mailbox: &mut dyn Mailbox, source_data: &str) -> SyncResult<VoicemailPayload> {
    let not_found = || SyncError::VoicemailNotFound(source_data.to_string());

    if mailbox.open_folder(FolderMode::ReadOnly).await?.is_none() {
        return Err(SyncError::FolderUnavailable(INBOX.to_string()));
    }
    if mailbox.find_message(source_data).await?.is_none() {
        return Err(not_found());
    }

    let StructureOutcome::Voicemail(message) = mailbox.fetch_structure(source_data).await? else {
        return Err(not_found());
    };
    mailbox.fetch_body(&message).await?.ok_or_else(not_found)
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncOrchestrator.
pub struct SyncOrchestratorBuilder {
    config: Arc<VvmConfig>,
    db: Option<Arc<Database>>,
    scheduler: Option<SchedulerHandle>,
    network: Option<NetworkManager>,
    reporter: Option<StatusReporter>,
    registry: Option<SourceRegistry>,
    connector: Option<Arc<dyn MailboxConnector>>,
}

impl SyncOrchestratorBuilder {
    pub fn new(config: Arc<VvmConfig>) -> Self {
        SyncOrchestratorBuilder {
            config,
            db: None,
            scheduler: None,
            network: None,
            reporter: None,
            registry: None,
            connector: None,
        }
    }

    /// Sets the database connection.
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Sets the scheduler the orchestrator enqueues follow-up tasks on.
    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_network(mut self, network: NetworkManager) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Shares an existing registry. Without one, a registry is built over
    /// the orchestrator's network, scheduler and reporter.
    pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn MailboxConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Builds the SyncOrchestrator.
    pub fn build(self) -> SyncResult<SyncOrchestrator> {
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let scheduler = self
            .scheduler
            .ok_or_else(|| SyncError::InvalidConfig("Scheduler required".into()))?;

        let network = self.network.unwrap_or_default();
        let reporter = self
            .reporter
            .unwrap_or_else(|| StatusReporter::new(db.clone(), Arc::new(NoOpEmitter)));
        let registry = self.registry.unwrap_or_else(|| {
            SourceRegistry::new(network.clone(), scheduler.clone(), reporter.clone())
        });
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(ImapConnector::tcp(
                self.config.acquire_timeout(),
                self.config.read_timeout(),
            ))
        });

        let activator = Activator::new(
            self.config.clone(),
            db.clone(),
            registry.clone(),
            reporter.clone(),
            scheduler.clone(),
        );

        Ok(SyncOrchestrator {
            config: self.config,
            db,
            network,
            connector,
            registry,
            scheduler,
            reporter,
            activator,
        })
    }
}
