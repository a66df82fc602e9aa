//! # IMAP Transport
//!
//! Stateful wrapper around one mailbox connection for one account, used for
//! the duration of a single sync pass.
//!
//! ## State
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Idle ──connect()──► Connected ──open_folder()──► FolderOpen           │
//! │    ▲                      │                            │                │
//! │    │                      │ I/O error                  │ I/O error      │
//! │    └──────────────────────┴────────────────────────────┘                │
//! │    ▲                                                                    │
//! │    └───────────────── close(): EXPUNGE, LOGOUT ◄── any state            │
//! │                                                                         │
//! │   The connection is opened lazily and reused by every call of the      │
//! │   pass. A broken connection is dropped; folder-bound calls then fail   │
//! │   with FolderUnavailable instead of silently reconnecting.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use vvm_core::{AccountHandle, ChangePinResult, ImapCredentials, Quota, VoicemailPayload};

use super::connection::{has_flag, ConnectionSettings, ImapConnection};
use super::folder::{
    self, FetchedStructure, Flag, FolderInfo, FolderMode, RemoteMessage, StructureOutcome,
};
use super::stream::StreamOpener;
use crate::config::CarrierConfig;
use crate::error::{SyncError, SyncResult};

/// Stateful IMAP client for one account.
pub struct ImapTransport {
    account: AccountHandle,
    credentials: ImapCredentials,
    carrier: CarrierConfig,
    opener: Arc<dyn StreamOpener>,
    read_timeout: Duration,
    connection: Option<ImapConnection>,
    folder: Option<FolderInfo>,
}

impl ImapTransport {
    pub fn new(
        account: AccountHandle,
        credentials: ImapCredentials,
        carrier: CarrierConfig,
        opener: Arc<dyn StreamOpener>,
        read_timeout: Duration,
    ) -> Self {
        ImapTransport {
            account,
            credentials,
            carrier,
            opener,
            read_timeout,
            connection: None,
            folder: None,
        }
    }

    pub fn account(&self) -> &AccountHandle {
        &self.account
    }

    pub fn carrier(&self) -> &CarrierConfig {
        &self.carrier
    }

    /// Port and TLS mode to connect with.
    ///
    /// The stored port must parse even when the carrier's SSL port overrides
    /// it.
    fn endpoint(&self) -> SyncResult<(u16, bool)> {
        let port = self
            .credentials
            .port_number()
            .map_err(|_| SyncError::InvalidPort(self.credentials.port.clone()))?;

        if self.carrier.ssl_port != 0 {
            Ok((self.carrier.ssl_port, true))
        } else {
            Ok((port, false))
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Opens and authenticates the connection unless it is already up.
    pub async fn connect(&mut self) -> SyncResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let (port, implicit_tls) = self.endpoint()?;
        let settings = ConnectionSettings {
            host: self.credentials.server.clone(),
            port,
            implicit_tls,
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            disabled_capabilities: self.carrier.disabled_capabilities.clone(),
            read_timeout: self.read_timeout,
        };

        let connection = ImapConnection::open(self.opener.as_ref(), &settings).await?;
        info!(
            account = %self.account,
            server = %settings.host,
            port,
            implicit_tls,
            "IMAP session established"
        );
        self.connection = Some(connection);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn session(&mut self) -> SyncResult<&mut ImapConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| SyncError::FolderUnavailable(folder::INBOX.into()))
    }

    /// Drops the connection if `result` shows the stream broke.
    fn checked<T>(&mut self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(e) = &result {
            self.discard_if_broken(e);
        }
        result
    }

    fn discard_if_broken(&mut self, error: &SyncError) {
        if matches!(
            error,
            SyncError::Io(_) | SyncError::Timeout(_) | SyncError::InvalidMessage(_)
        ) {
            warn!(account = %self.account, ?error, "IMAP connection lost");
            self.connection = None;
            self.folder = None;
        }
    }

    fn require_folder(&self) -> SyncResult<()> {
        if self.folder.is_some() && self.connection.is_some() {
            Ok(())
        } else {
            Err(SyncError::FolderUnavailable(folder::INBOX.into()))
        }
    }

    // =========================================================================
    // Folder
    // =========================================================================

    /// Opens the inbox.
    ///
    /// Connection and login failures are errors. A refused SELECT, or a
    /// connection that drops during it, gives `Ok(None)`.
    pub async fn open_folder(&mut self, mode: FolderMode) -> SyncResult<Option<FolderInfo>> {
        if let Some(info) = &self.folder {
            return Ok(Some(info.clone()));
        }

        self.connect().await?;
        let result = self.session()?.open_inbox(mode).await;
        match self.checked(result) {
            Ok(info) => {
                debug!(
                    account = %self.account,
                    messages = info.message_count,
                    mode = ?info.mode,
                    "Inbox opened"
                );
                self.folder = Some(info.clone());
                Ok(Some(info))
            }
            Err(e) => {
                warn!(account = %self.account, ?e, "Inbox could not be opened");
                Ok(None)
            }
        }
    }

    /// UIDs of every non-deleted message.
    pub async fn list_messages(&mut self) -> SyncResult<Vec<String>> {
        self.require_folder()?;
        let result = self.session()?.uid_search(folder::SEARCH_ALL).await;
        let uids = folder::sorted_uids(self.checked(result)?);
        debug!(account = %self.account, count = uids.len(), "Listed messages");
        Ok(uids)
    }

    /// Looks up one UID. `None` if the server does not have it.
    pub async fn find_message(&mut self, uid: &str) -> SyncResult<Option<String>> {
        self.require_folder()?;
        let Ok(wanted) = uid.parse::<u32>() else {
            return Ok(None);
        };

        let result = self
            .session()?
            .uid_search(&folder::search_uid_criteria(uid))
            .await;
        match self.checked(result) {
            Ok(found) => Ok(found.contains(&wanted).then(|| uid.to_string())),
            Err(SyncError::CommandRejected { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetches flags, headers and MIME structure, but no body.
    pub async fn fetch_structure(&mut self, uid: &str) -> SyncResult<StructureOutcome> {
        self.require_folder()?;
        let result = self
            .session()?
            .uid_fetch(uid, folder::STRUCTURE_QUERY)
            .await;

        let fetches = match self.checked(result) {
            Ok(fetches) => fetches,
            Err(SyncError::CommandRejected { text, .. }) => {
                warn!(account = %self.account, uid = %uid, text = %text, "Structure fetch refused");
                return Ok(StructureOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let Some(fetch) = fetches
            .iter()
            .find(|f| f.uid.map(|n| n.to_string()).as_deref() == Some(uid))
        else {
            return Ok(StructureOutcome::Missing);
        };

        Ok(folder::classify(
            uid,
            FetchedStructure {
                seen: has_flag(fetch, Flag::Seen),
                deleted: has_flag(fetch, Flag::Deleted),
                structure: fetch.bodystructure(),
                header: fetch.header(),
                internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
            },
        ))
    }

    async fn fetch_part(&mut self, uid: &str, part: &folder::BodyPart) -> SyncResult<Option<Vec<u8>>> {
        self.require_folder()?;
        let section = part.section()?;
        let result = self
            .session()?
            .uid_fetch(uid, &folder::fetch_part_query(&part.part_id))
            .await;
        let fetches = self.checked(result)?;

        let raw = fetches
            .iter()
            .filter(|f| f.uid.map(|n| n.to_string()).as_deref() == Some(uid))
            .find_map(|f| f.section(&section));
        match raw {
            Some(raw) => folder::decode_part(raw, &part.encoding).map(Some),
            None => Ok(None),
        }
    }

    /// Fetches and decodes the audio payload.
    pub async fn fetch_body(&mut self, message: &RemoteMessage) -> SyncResult<Option<VoicemailPayload>> {
        let audio = &message.audio;
        let data = self.fetch_part(&message.uid, audio).await?;

        Ok(data.map(|data| {
            debug!(uid = %message.uid, bytes = data.len(), "Fetched voicemail audio");
            VoicemailPayload {
                mime_type: audio.mime_type.clone(),
                data,
            }
        }))
    }

    /// Fetches only the transcription part, if the message has one.
    pub async fn fetch_transcription(&mut self, message: &RemoteMessage) -> SyncResult<Option<String>> {
        let Some(part) = &message.transcription else {
            return Ok(None);
        };
        let data = self.fetch_part(&message.uid, part).await?;
        Ok(data
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|text| !text.is_empty()))
    }

    /// Sets or clears a flag on a batch of messages.
    ///
    /// All or nothing: any failure reports the whole batch as failed.
    pub async fn set_flags(&mut self, uids: &[String], flag: Flag, value: bool) -> bool {
        if uids.is_empty() {
            return true;
        }
        if self.require_folder().is_err() {
            return false;
        }

        let query = folder::store_flags_query(flag, value);
        let result = match self.session() {
            Ok(session) => session.uid_store(&uids.join(","), &query).await,
            Err(e) => Err(e),
        };
        match self.checked(result) {
            Ok(()) => {
                debug!(account = %self.account, count = uids.len(), flag = %flag, value, "Flags stored");
                true
            }
            Err(e) => {
                warn!(account = %self.account, ?e, flag = %flag, "Flag update failed");
                false
            }
        }
    }

    // =========================================================================
    // Carrier Commands
    // =========================================================================

    /// Changes the voicemail PIN.
    ///
    /// The tagged answer decides the result; any text the carrier table does
    /// not know is a system error, and so is a connection that drops before
    /// the answer.
    pub async fn change_pin(&mut self, old_pin: &str, new_pin: &str) -> SyncResult<ChangePinResult> {
        self.connect().await?;
        let command = self.carrier.commands.change_pin_command(old_pin, new_pin);

        let result = self.session()?.run_raw(&command).await;
        let outcome = match self.checked(result) {
            Ok(()) => ChangePinResult::Success,
            Err(SyncError::CommandRejected { status, text, .. }) if status == "NO" => {
                ChangePinResult::from_server_text(&text)
            }
            Err(e @ (SyncError::Io(_) | SyncError::Timeout(_))) => {
                warn!(account = %self.account, ?e, "PIN change interrupted");
                ChangePinResult::SystemError
            }
            Err(e) => return Err(e),
        };
        info!(account = %self.account, result = ?outcome, "PIN change answered");
        Ok(outcome)
    }

    /// Changes the greeting language.
    pub async fn change_language(&mut self, language: &str) -> SyncResult<()> {
        self.connect().await?;
        let command = self.carrier.commands.change_language_command(language);
        let result = self.session()?.run_raw(&command).await;
        self.checked(result)
    }

    /// Dismisses the new user tutorial.
    pub async fn close_tutorial(&mut self) -> SyncResult<()> {
        self.connect().await?;
        let command = self.carrier.commands.close_tutorial_command();
        let result = self.session()?.run_raw(&command).await;
        self.checked(result)
    }

    /// Mailbox usage. `None` if the server has no quota support.
    pub async fn get_quota(&mut self) -> SyncResult<Option<Quota>> {
        self.connect().await?;
        let result = self.session()?.quota().await;
        match self.checked(result) {
            Ok(quotas) => Ok(folder::voice_quota(&quotas)),
            Err(SyncError::CommandRejected { text, .. }) => {
                debug!(account = %self.account, text = %text, "Quota not supported");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Closes the folder (expunging if it was writable), then the session.
    pub async fn close(&mut self) {
        if let Some(info) = self.folder.take() {
            if info.mode == FolderMode::ReadWrite {
                if let Ok(session) = self.session() {
                    if let Err(e) = session.expunge().await {
                        warn!(account = %self.account, ?e, "Expunge failed");
                        self.discard_if_broken(&e);
                    }
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.close().await;
            debug!(account = %self.account, "IMAP session closed");
        }
    }
}
