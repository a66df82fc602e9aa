//! # Sync Error Types
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Transient I/O  │  │  Protocol rejection     │ │
//! │  │  (fatal, no     │  │  (retried only  │  │  (mapped to a reason)   │ │
//! │  │   retry)        │  │   by the next   │  │                         │ │
//! │  │                 │  │   trigger)      │  │  AuthenticationFailed   │ │
//! │  │  InvalidPort    │  │  NetworkUnavail │  │  CommandRejected        │ │
//! │  │  MissingCreds   │  │  ConnectionFail │  │  InvalidGreeting        │ │
//! │  │  InvalidConfig  │  │  Io / Timeout   │  │  InvalidMessage         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Every variant that concerns the data channel maps to a VvmEvent via   │
//! │  `status_event()`, which the orchestrator writes to VoicemailStatus.   │
//! │  A message that cannot be parsed as a voicemail is never an error: it  │
//! │  is logged and skipped.                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use vvm_core::{ValidationError, VvmEvent};

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// The stored IMAP port is not a number.
    ///
    /// ## When This Occurs
    /// - The carrier STATUS message carried a malformed `ipt` field
    #[error("Invalid IMAP port: '{0}'")]
    InvalidPort(String),

    /// No credentials stored for the account.
    #[error("No IMAP credentials for account {0}")]
    MissingCredentials(String),

    /// A user-supplied value failed validation before anything was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Network / Transport Errors
    // =========================================================================
    /// No usable network was granted before the acquire timeout.
    #[error("No network available (cellular required: {cellular_required})")]
    NetworkUnavailable { cellular_required: bool },

    /// TCP connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS handshake failed.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Socket error while the session was being set up (greeting,
    /// capability, STARTTLS, login).
    #[error("I/O error while opening session: {0}")]
    SessionOpenFailed(String),

    /// Socket error on an established session.
    #[error("I/O error: {0}")]
    Io(String),

    /// Server did not answer in time.
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The server greeting was not `* OK`.
    #[error("Invalid initial server response: {0}")]
    InvalidGreeting(String),

    /// LOGIN was refused.
    #[error("Authentication failed ({event}): {message}")]
    AuthenticationFailed { event: VvmEvent, message: String },

    /// A tagged NO or BAD answer.
    #[error("{command} rejected with {status}: {text}")]
    CommandRejected {
        command: String,
        status: String,
        code: Option<String>,
        text: String,
    },

    /// Response could not be parsed.
    #[error("Invalid server response: {0}")]
    InvalidMessage(String),

    /// The inbox could not be selected.
    #[error("Folder {0} could not be opened")]
    FolderUnavailable(String),

    /// The requested voicemail is not stored locally or on the server.
    #[error("Voicemail {0} not found")]
    VoicemailNotFound(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Local store operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The scheduler is shutting down.
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<vvm_db::DbError> for SyncError {
    fn from(err: vvm_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<vvm_core::CoreError> for SyncError {
    fn from(err: vvm_core::CoreError) -> Self {
        match err {
            vvm_core::CoreError::Validation(e) => SyncError::Validation(e),
            other => SyncError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<async_imap::error::Error> for SyncError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error;

        match err {
            Error::Io(e) => SyncError::Io(e.to_string()),
            Error::ConnectionLost => SyncError::Io("connection lost".into()),
            Error::No(text) => SyncError::CommandRejected {
                command: "IMAP".into(),
                status: "NO".into(),
                code: None,
                text: status_text(&text),
            },
            Error::Bad(text) => SyncError::CommandRejected {
                command: "IMAP".into(),
                status: "BAD".into(),
                code: None,
                text: status_text(&text),
            },
            other => SyncError::InvalidMessage(other.to_string()),
        }
    }
}

/// The human-readable part of a tagged NO / BAD.
///
/// async-imap reports rejections as `code: .., info: Some("text")`; the
/// carrier's status text is what PIN and login results are keyed on.
pub(crate) fn status_text(raw: &str) -> String {
    const MARKER: &str = "info: Some(\"";
    match raw.find(MARKER) {
        Some(start) => {
            let rest = &raw[start + MARKER.len()..];
            let end = rest.rfind("\")").unwrap_or(rest.len());
            rest[..end].replace("\\\"", "\"")
        }
        None => raw.trim().to_string(),
    }
}

impl From<native_tls::Error> for SyncError {
    fn from(err: native_tls::Error) -> Self {
        SyncError::TlsError(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true for transient failures that the next trigger may fix.
    ///
    /// Nothing inside a task retries on these; only on-demand payload fetch
    /// uses this to drive its backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable { .. }
                | SyncError::ConnectionFailed(_)
                | SyncError::SessionOpenFailed(_)
                | SyncError::Io(_)
                | SyncError::Timeout(_)
                | SyncError::FolderUnavailable(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::InvalidPort(_)
                | SyncError::MissingCredentials(_)
                | SyncError::Validation(_)
        )
    }

    /// Returns true if the server refused or garbled an exchange.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidGreeting(_)
                | SyncError::AuthenticationFailed { .. }
                | SyncError::CommandRejected { .. }
                | SyncError::InvalidMessage(_)
        )
    }

    /// The status event this failure is reported as, if it concerns the
    /// data channel.
    pub fn status_event(&self) -> Option<VvmEvent> {
        match self {
            SyncError::InvalidPort(_) => Some(VvmEvent::DataInvalidPort),
            SyncError::MissingCredentials(_) => Some(VvmEvent::ConfigNotConfigured),
            SyncError::NetworkUnavailable { cellular_required: true } => {
                Some(VvmEvent::DataNoConnectionCellularRequired)
            }
            SyncError::NetworkUnavailable { cellular_required: false } => {
                Some(VvmEvent::DataNoConnection)
            }
            SyncError::ConnectionFailed(_) => Some(VvmEvent::DataCannotEstablishConnection),
            SyncError::TlsError(_) => Some(VvmEvent::DataSslException),
            SyncError::SessionOpenFailed(_) => Some(VvmEvent::DataIoeOnOpen),
            SyncError::Io(_) | SyncError::Timeout(_) | SyncError::InvalidMessage(_) => {
                Some(VvmEvent::DataGenericImapIoe)
            }
            SyncError::InvalidGreeting(_) => Some(VvmEvent::DataInvalidInitialServerResponse),
            SyncError::AuthenticationFailed { event, .. } => Some(*event),
            SyncError::CommandRejected { .. } => Some(VvmEvent::DataRejectedServerResponse),
            SyncError::FolderUnavailable(_) => Some(VvmEvent::DataMailboxOpenFailed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("reset".into()).is_retryable());
        assert!(SyncError::NetworkUnavailable { cellular_required: false }.is_retryable());
        assert!(SyncError::Timeout(30).is_retryable());

        assert!(!SyncError::InvalidPort("x".into()).is_retryable());
        assert!(!SyncError::AuthenticationFailed {
            event: VvmEvent::DataAuthInvalidPassword,
            message: "invalid password".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::InvalidPort("14x3".into()).is_config_error());
        assert!(SyncError::CommandRejected {
            command: "SELECT".into(),
            status: "NO".into(),
            code: None,
            text: "nope".into(),
        }
        .is_protocol_error());
        assert!(!SyncError::Io("broken pipe".into()).is_protocol_error());
    }

    #[test]
    fn test_status_events() {
        assert_eq!(
            SyncError::InvalidPort("abc".into()).status_event(),
            Some(VvmEvent::DataInvalidPort)
        );
        assert_eq!(
            SyncError::NetworkUnavailable { cellular_required: true }.status_event(),
            Some(VvmEvent::DataNoConnectionCellularRequired)
        );
        assert_eq!(
            SyncError::AuthenticationFailed {
                event: VvmEvent::DataAuthUserIsBlocked,
                message: String::new()
            }
            .status_event(),
            Some(VvmEvent::DataAuthUserIsBlocked)
        );
        assert_eq!(SyncError::DatabaseError("locked".into()).status_event(), None);
    }

    #[test]
    fn test_imap_error_conversion() {
        let err: SyncError = async_imap::error::Error::ConnectionLost.into();
        assert!(err.is_retryable());
        assert_eq!(err.status_event(), Some(VvmEvent::DataGenericImapIoe));

        let err: SyncError = async_imap::error::Error::No("not now".into()).into();
        assert!(matches!(err, SyncError::CommandRejected { ref status, .. } if status == "NO"));
    }

    #[test]
    fn test_status_text() {
        assert_eq!(
            status_text("code: None, info: Some(\"password too weak\")"),
            "password too weak"
        );
        assert_eq!(status_text(" user is blocked "), "user is blocked");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: SyncError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer").into();
        assert!(matches!(err, SyncError::Io(_)));
        assert!(err.is_retryable());
    }
}
