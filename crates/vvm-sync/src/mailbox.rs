//! Remote mailbox seen by the reconciliation engine and the orchestrator.
//!
//! [`ImapTransport`] is the production implementation. The engine only talks
//! to `dyn Mailbox`, so a sync pass can run against an in-memory mailbox in
//! tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use vvm_core::{AccountHandle, ChangePinResult, ImapCredentials, Quota, VoicemailPayload};

use crate::config::CarrierConfig;
use crate::error::SyncResult;
use crate::imap::{
    Flag, FolderInfo, FolderMode, ImapTransport, RemoteMessage, StreamOpener, StructureOutcome,
    TcpOpener,
};
use crate::network::NetworkLease;

/// One account's remote voicemail box for the length of a task.
#[async_trait]
pub trait Mailbox: Send {
    async fn open_folder(&mut self, mode: FolderMode) -> SyncResult<Option<FolderInfo>>;

    async fn list_messages(&mut self) -> SyncResult<Vec<String>>;

    async fn find_message(&mut self, uid: &str) -> SyncResult<Option<String>>;

    async fn fetch_structure(&mut self, uid: &str) -> SyncResult<StructureOutcome>;

    async fn fetch_body(&mut self, message: &RemoteMessage) -> SyncResult<Option<VoicemailPayload>>;

    async fn fetch_transcription(&mut self, message: &RemoteMessage) -> SyncResult<Option<String>>;

    async fn set_flags(&mut self, uids: &[String], flag: Flag, value: bool) -> bool;

    async fn change_pin(&mut self, old_pin: &str, new_pin: &str) -> SyncResult<ChangePinResult>;

    async fn change_language(&mut self, language: &str) -> SyncResult<()>;

    async fn close_tutorial(&mut self) -> SyncResult<()>;

    async fn get_quota(&mut self) -> SyncResult<Option<Quota>>;

    /// Closes the folder, then the connection. Never fails.
    async fn close(&mut self);
}

#[async_trait]
impl Mailbox for ImapTransport {
    async fn open_folder(&mut self, mode: FolderMode) -> SyncResult<Option<FolderInfo>> {
        ImapTransport::open_folder(self, mode).await
    }

    async fn list_messages(&mut self) -> SyncResult<Vec<String>> {
        ImapTransport::list_messages(self).await
    }

    async fn find_message(&mut self, uid: &str) -> SyncResult<Option<String>> {
        ImapTransport::find_message(self, uid).await
    }

    async fn fetch_structure(&mut self, uid: &str) -> SyncResult<StructureOutcome> {
        ImapTransport::fetch_structure(self, uid).await
    }

    async fn fetch_body(&mut self, message: &RemoteMessage) -> SyncResult<Option<VoicemailPayload>> {
        ImapTransport::fetch_body(self, message).await
    }

    async fn fetch_transcription(&mut self, message: &RemoteMessage) -> SyncResult<Option<String>> {
        ImapTransport::fetch_transcription(self, message).await
    }

    async fn set_flags(&mut self, uids: &[String], flag: Flag, value: bool) -> bool {
        ImapTransport::set_flags(self, uids, flag, value).await
    }

    async fn change_pin(&mut self, old_pin: &str, new_pin: &str) -> SyncResult<ChangePinResult> {
        ImapTransport::change_pin(self, old_pin, new_pin).await
    }

    async fn change_language(&mut self, language: &str) -> SyncResult<()> {
        ImapTransport::change_language(self, language).await
    }

    async fn close_tutorial(&mut self) -> SyncResult<()> {
        ImapTransport::close_tutorial(self).await
    }

    async fn get_quota(&mut self) -> SyncResult<Option<Quota>> {
        ImapTransport::get_quota(self).await
    }

    async fn close(&mut self) {
        ImapTransport::close(self).await
    }
}

/// Builds the mailbox of a task once its network lease is held.
pub trait MailboxConnector: Send + Sync {
    fn connect(
        &self,
        account: &AccountHandle,
        credentials: ImapCredentials,
        carrier: &CarrierConfig,
        lease: &NetworkLease,
    ) -> Box<dyn Mailbox>;
}

/// Connects real IMAP transports.
pub struct ImapConnector {
    opener: Arc<dyn StreamOpener>,
    read_timeout: Duration,
}

impl ImapConnector {
    pub fn new(opener: Arc<dyn StreamOpener>, read_timeout: Duration) -> Self {
        ImapConnector {
            opener,
            read_timeout,
        }
    }

    /// TCP + native TLS with the given socket timeouts.
    pub fn tcp(connect_timeout: Duration, read_timeout: Duration) -> Self {
        ImapConnector::new(Arc::new(TcpOpener::new(connect_timeout)), read_timeout)
    }
}

impl MailboxConnector for ImapConnector {
    fn connect(
        &self,
        account: &AccountHandle,
        credentials: ImapCredentials,
        carrier: &CarrierConfig,
        lease: &NetworkLease,
    ) -> Box<dyn Mailbox> {
        tracing::debug!(account = %account, network = %lease.kind(), "Binding mailbox to network");
        Box::new(ImapTransport::new(
            account.clone(),
            credentials,
            carrier.clone(),
            self.opener.clone(),
            self.read_timeout,
        ))
    }
}
