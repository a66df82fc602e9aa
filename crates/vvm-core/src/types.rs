//! # Domain Types
//!
//! The data model shared by the local store and the sync engine.
//!
//! ## Local vs Remote
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Local store row                         Remote IMAP message           │
//! │   ───────────────                         ───────────────────           │
//! │   id (row id)                             UID ◄────────┐                │
//! │   source_data ────── sole join key ───────────────────┘                │
//! │   is_read / is_deleted / is_dirty         \Seen / \Deleted              │
//! │   transcription                           text/* body part              │
//! │   has_content (audio cached)              audio/* body part             │
//! │   is_archived                             (removed to free quota)       │
//! │                                                                         │
//! │   Both sides are projected into `Voicemail`; only local rows carry an  │
//! │   `id` and meaningful dirty/deleted/archived flags.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::{CoreError, ValidationError};
use crate::omtp::{self, VvmEvent};

// =============================================================================
// Account Handle
// =============================================================================

/// Identifies one voicemail account (one phone account / SIM subscription).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct AccountHandle(String);

impl AccountHandle {
    /// Creates a handle from its opaque id.
    pub fn new(id: impl Into<String>) -> Self {
        AccountHandle(id.into())
    }

    /// Returns the opaque id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountHandle {
    fn from(id: &str) -> Self {
        AccountHandle(id.to_string())
    }
}

// =============================================================================
// Voicemail
// =============================================================================

/// One voicemail message.
///
/// `source_data` is the server-assigned UID and the only key used to match a
/// local row with its remote message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Voicemail {
    /// Local row id. `None` for messages that only exist remotely.
    pub id: Option<i64>,

    /// Owning account.
    pub account: AccountHandle,

    /// Server UID of the message.
    pub source_data: String,

    /// When the message was sent.
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,

    /// Caller number, taken from the "from" address with the domain removed.
    pub number: Option<String>,

    /// Read state.
    pub is_read: bool,

    /// Length in seconds, when the server reports it.
    pub duration: Option<i64>,

    /// Transcription text, when one has been fetched.
    pub transcription: Option<String>,

    /// Local change not yet pushed to the server.
    pub is_dirty: bool,

    /// Deleted locally, waiting for the server to acknowledge.
    pub is_deleted: bool,

    /// Removed from the server to free quota; kept locally.
    pub is_archived: bool,

    /// Audio payload is cached locally.
    pub has_content: bool,
}

impl Voicemail {
    /// Builds a voicemail as it is first seen on the server.
    pub fn for_insertion(
        account: AccountHandle,
        source_data: impl Into<String>,
        timestamp: DateTime<Utc>,
        number: Option<String>,
    ) -> Self {
        Voicemail {
            id: None,
            account,
            source_data: source_data.into(),
            timestamp,
            number,
            is_read: false,
            duration: None,
            transcription: None,
            is_dirty: false,
            is_deleted: false,
            is_archived: false,
            has_content: false,
        }
    }

    /// Sets the read state.
    pub fn with_read(mut self, is_read: bool) -> Self {
        self.is_read = is_read;
        self
    }

    /// Sets the duration in seconds.
    pub fn with_duration(mut self, duration: Option<i64>) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the transcription.
    pub fn with_transcription(mut self, transcription: Option<String>) -> Self {
        self.transcription = transcription;
        self
    }

    /// Returns true when a non-empty transcription is present.
    pub fn has_transcription(&self) -> bool {
        self.transcription.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Returns true when the local read flag still has to be pushed upstream.
    pub fn has_pending_read(&self) -> bool {
        self.is_dirty && self.is_read && !self.is_deleted
    }
}

/// Decoded audio of one voicemail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicemailPayload {
    /// MIME type of the audio part, lower-cased (e.g. `audio/amr`).
    pub mime_type: String,

    /// Decoded audio bytes.
    pub data: Vec<u8>,
}

// =============================================================================
// Quota
// =============================================================================

/// Remote mailbox usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Quota {
    /// Messages currently stored.
    pub occupied: i64,

    /// Messages the mailbox can hold.
    pub total: i64,
}

impl Quota {
    /// Creates a quota.
    pub fn new(occupied: i64, total: i64) -> Self {
        Quota { occupied, total }
    }

    /// Returns true when usage is strictly above `threshold` (0.0 - 1.0).
    ///
    /// An unknown or zero total is never above any threshold.
    pub fn is_above(&self, threshold: f64) -> bool {
        if self.total <= 0 {
            return false;
        }
        (self.occupied as f64 / self.total as f64) > threshold
    }

    /// Number of messages that must be removed to get back to `threshold`.
    pub fn excess_over(&self, threshold: f64) -> i64 {
        let allowed = (threshold * self.total as f64).floor() as i64;
        (self.occupied - allowed).max(0)
    }
}

// =============================================================================
// Sync Action
// =============================================================================

/// What a scheduled task should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Upload local changes, then download remote state.
    FullSync,

    /// Push local read/deleted flags only.
    UploadOnly,

    /// Pull remote state only.
    DownloadOnly,

    /// Fetch the transcription (and payload, if prefetching) of one voicemail.
    DownloadOneTranscription,

    /// Provision the account as an active voicemail source.
    Activate,
}

impl SyncAction {
    /// All actions, in declaration order.
    pub const ALL: [SyncAction; 5] = [
        SyncAction::FullSync,
        SyncAction::UploadOnly,
        SyncAction::DownloadOnly,
        SyncAction::DownloadOneTranscription,
        SyncAction::Activate,
    ];

    /// The mode string carried by triggers.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::FullSync => omtp::SYNC_FULL_SYNC,
            SyncAction::UploadOnly => omtp::SYNC_UPLOAD_ONLY,
            SyncAction::DownloadOnly => omtp::SYNC_DOWNLOAD_ONLY,
            SyncAction::DownloadOneTranscription => omtp::SYNC_DOWNLOAD_ONE_TRANSCRIPTION,
            SyncAction::Activate => omtp::ACTIVATE,
        }
    }

    /// Returns true if the action pushes local changes.
    pub fn includes_upload(&self) -> bool {
        matches!(self, SyncAction::FullSync | SyncAction::UploadOnly)
    }

    /// Returns true if the action pulls remote state for the whole mailbox.
    pub fn includes_download(&self) -> bool {
        matches!(self, SyncAction::FullSync | SyncAction::DownloadOnly)
    }

    /// Returns true if the action targets one voicemail.
    pub fn is_single_voicemail(&self) -> bool {
        matches!(self, SyncAction::DownloadOneTranscription)
    }

    /// Returns true if equivalent triggers should be collapsed over a quiet window.
    pub fn is_postponed(&self) -> bool {
        matches!(self, SyncAction::UploadOnly)
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| CoreError::UnknownSyncAction(s.to_string()))
    }
}

// =============================================================================
// Voicemail Status
// =============================================================================

/// Provisioning state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationState {
    /// Activated and usable.
    Ok,
    /// No usable credentials yet.
    #[default]
    NotConfigured,
    /// Activation in progress.
    Configuring,
    /// Activation failed.
    Failed,
    /// Removed as a voicemail source; status reporting is off.
    Disabled,
}

/// Health of the IMAP data channel of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum DataChannelState {
    #[default]
    Ok,
    NoConnection,
    NoConnectionCellularRequired,
    BadConfiguration,
    CommunicationError,
    ServerError,
    ServerConnectionError,
}

/// Per-account sync health, overwritten by every sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct VoicemailStatus {
    /// Account this status belongs to.
    pub account: AccountHandle,

    /// Provisioning state.
    pub configuration_state: ConfigurationState,

    /// Data channel state.
    pub data_channel_state: DataChannelState,

    /// Name of the most recent event applied.
    pub last_event: Option<String>,

    /// Remote messages stored, if known.
    pub quota_occupied: Option<i64>,

    /// Remote capacity, if known.
    pub quota_total: Option<i64>,

    /// When the status was last written.
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl VoicemailStatus {
    /// Creates the initial status of an account.
    pub fn new(account: AccountHandle) -> Self {
        VoicemailStatus {
            account,
            configuration_state: ConfigurationState::NotConfigured,
            data_channel_state: DataChannelState::Ok,
            last_event: None,
            quota_occupied: None,
            quota_total: None,
            updated_at: Utc::now(),
        }
    }

    /// Applies the status effect of an event.
    pub fn apply_event(&mut self, event: VvmEvent) {
        if let Some(state) = event.configuration_state() {
            self.configuration_state = state;
        }
        if let Some(state) = event.data_channel_state() {
            self.data_channel_state = state;
        }
        self.last_event = Some(event.as_str().to_string());
        self.updated_at = Utc::now();
    }

    /// Records a freshly queried quota.
    pub fn set_quota(&mut self, quota: Quota) {
        self.quota_occupied = Some(quota.occupied);
        self.quota_total = Some(quota.total);
        self.updated_at = Utc::now();
    }

    /// Returns the stored quota, if both counters are known.
    pub fn quota(&self) -> Option<Quota> {
        match (self.quota_occupied, self.quota_total) {
            (Some(occupied), Some(total)) => Some(Quota::new(occupied, total)),
            _ => None,
        }
    }
}

// =============================================================================
// IMAP Credentials
// =============================================================================

/// Mailbox credentials delivered by the carrier when the account is provisioned.
///
/// The port is kept as received; it is parsed when a connection is opened so a
/// malformed value surfaces as a configuration error of that sync.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapCredentials {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: String,
}

impl ImapCredentials {
    /// Builds credentials from OMTP STATUS key/value fields (`u`, `pw`, `srv`, `ipt`).
    pub fn from_status_fields(fields: &HashMap<String, String>) -> Result<Self, CoreError> {
        let field = |key: &'static str| {
            fields
                .get(key)
                .cloned()
                .ok_or(CoreError::MissingCredentialField(key))
        };

        Ok(ImapCredentials {
            username: field(omtp::IMAP_USER_NAME)?,
            password: field(omtp::IMAP_PASSWORD)?,
            server: field(omtp::SERVER_ADDRESS)?,
            port: field(omtp::IMAP_PORT)?,
        })
    }

    /// Parses the stored port.
    pub fn port_number(&self) -> Result<u16, ValidationError> {
        self.port
            .trim()
            .parse::<u16>()
            .map_err(|_| ValidationError::InvalidPort(self.port.clone()))
    }
}

impl fmt::Debug for ImapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("port", &self.port)
            .finish()
    }
}
