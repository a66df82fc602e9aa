//! # OMTP Protocol Vocabulary
//!
//! Constants and closed enumerations from the OMTP Visual Voicemail
//! interface specification, plus the status events the engine reports.
//!
//! ## Event → Status Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Event family              configuration_state   data_channel_state     │
//! │  ────────────              ───────────────────   ──────────────────     │
//! │  Config*                   set                   unchanged              │
//! │  DataImapOperation*        Ok                    Ok                     │
//! │  DataNoConnection*         unchanged             NoConnection(...)      │
//! │  DataInvalidPort           unchanged             BadConfiguration       │
//! │  DataIoeOnOpen, Ssl...     unchanged             ServerConnectionError  │
//! │  DataMailboxOpenFailed,    unchanged             CommunicationError     │
//! │  DataGenericImapIoe                                                     │
//! │  DataAuth*, Rejected...    unchanged             ServerError            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{ConfigurationState, DataChannelState};

// =============================================================================
// Sync Mode Strings
// =============================================================================

pub const SYNC_FULL_SYNC: &str = "full_sync";
pub const SYNC_UPLOAD_ONLY: &str = "upload_only";
pub const SYNC_DOWNLOAD_ONLY: &str = "download_only";
pub const SYNC_DOWNLOAD_ONE_TRANSCRIPTION: &str = "download_one_transcription";
pub const ACTIVATE: &str = "activate";

// =============================================================================
// STATUS Message Credential Keys
// =============================================================================

/// IMAP user name.
pub const IMAP_USER_NAME: &str = "u";
/// IMAP password.
pub const IMAP_PASSWORD: &str = "pw";
/// IMAP server host.
pub const SERVER_ADDRESS: &str = "srv";
/// IMAP port.
pub const IMAP_PORT: &str = "ipt";

// =============================================================================
// Carrier Command Formats
// =============================================================================

/// Default PIN change command. `{new_pin}` comes before `{old_pin}`.
pub const IMAP_CHANGE_TUI_PWD_FORMAT: &str = "XCHANGE_TUI_PWD PWD={new_pin} OLD_PWD={old_pin}";
/// Default greeting language command.
pub const IMAP_CHANGE_VM_LANG_FORMAT: &str = "XCHANGE_VM_LANG LANG={language}";
/// Default "close new user tutorial" command.
pub const IMAP_CLOSE_NUT: &str = "XCLOSE_NUT";

// =============================================================================
// Server Response Texts
// =============================================================================

pub const RESPONSE_CHANGE_PIN_TOO_SHORT: &str = "password too short";
pub const RESPONSE_CHANGE_PIN_TOO_LONG: &str = "password too long";
pub const RESPONSE_CHANGE_PIN_TOO_WEAK: &str = "password too weak";
pub const RESPONSE_CHANGE_PIN_MISMATCH: &str = "old password mismatch";
pub const RESPONSE_CHANGE_PIN_INVALID_CHARACTER: &str = "password contains invalid characters";

pub const NO_UNKNOWN_USER: &str = "unknown user";
pub const NO_UNKNOWN_CLIENT: &str = "unknown client";
pub const NO_INVALID_PASSWORD: &str = "invalid password";
pub const NO_MAILBOX_NOT_INITIALIZED: &str = "mailbox not initialized";
pub const NO_SERVICE_IS_NOT_PROVISIONED: &str = "service is not provisioned";
pub const NO_SERVICE_IS_NOT_ACTIVATED: &str = "service is not activated";
pub const NO_USER_IS_BLOCKED: &str = "user is blocked";
pub const NO_APPLICATION_ERROR: &str = "application error";

// =============================================================================
// Change PIN Result
// =============================================================================

/// Outcome of a PIN change, decoded from the server's tagged response.
///
/// Discriminants match the OMTP numeric result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ChangePinResult {
    Success = 0,
    TooShort = 1,
    TooLong = 2,
    TooWeak = 3,
    Mismatch = 4,
    InvalidCharacter = 5,
    SystemError = 6,
}

impl ChangePinResult {
    /// Maps the free-form text of a rejected PIN change.
    ///
    /// Anything unrecognised is a system error, never success.
    pub fn from_server_text(text: &str) -> Self {
        match text.trim() {
            RESPONSE_CHANGE_PIN_TOO_SHORT => ChangePinResult::TooShort,
            RESPONSE_CHANGE_PIN_TOO_LONG => ChangePinResult::TooLong,
            RESPONSE_CHANGE_PIN_TOO_WEAK => ChangePinResult::TooWeak,
            RESPONSE_CHANGE_PIN_MISMATCH => ChangePinResult::Mismatch,
            RESPONSE_CHANGE_PIN_INVALID_CHARACTER => ChangePinResult::InvalidCharacter,
            _ => ChangePinResult::SystemError,
        }
    }

    /// OMTP numeric code.
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ChangePinResult::Success)
    }
}

// =============================================================================
// Status Events
// =============================================================================

/// Something that happened during activation or a sync, reported to status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum VvmEvent {
    // Configuration
    ConfigActivating,
    ConfigActivationSucceeded,
    ConfigNotConfigured,
    ConfigDisabled,

    // Data channel
    DataImapOperationStarted,
    DataImapOperationCompleted,
    DataNoConnection,
    DataNoConnectionCellularRequired,
    DataInvalidPort,
    DataInvalidInitialServerResponse,
    DataSslException,
    DataIoeOnOpen,
    DataCannotEstablishConnection,
    DataMailboxOpenFailed,
    DataGenericImapIoe,
    DataBadImapCredential,
    DataAuthUnknownUser,
    DataAuthUnknownDevice,
    DataAuthInvalidPassword,
    DataAuthMailboxNotInitialized,
    DataAuthServiceNotProvisioned,
    DataAuthServiceNotActivated,
    DataAuthUserIsBlocked,
    DataRejectedServerResponse,
}

impl VvmEvent {
    /// Stable snake_case name, stored as the status' last event.
    pub fn as_str(&self) -> &'static str {
        match self {
            VvmEvent::ConfigActivating => "config_activating",
            VvmEvent::ConfigActivationSucceeded => "config_activation_succeeded",
            VvmEvent::ConfigNotConfigured => "config_not_configured",
            VvmEvent::ConfigDisabled => "config_disabled",
            VvmEvent::DataImapOperationStarted => "data_imap_operation_started",
            VvmEvent::DataImapOperationCompleted => "data_imap_operation_completed",
            VvmEvent::DataNoConnection => "data_no_connection",
            VvmEvent::DataNoConnectionCellularRequired => "data_no_connection_cellular_required",
            VvmEvent::DataInvalidPort => "data_invalid_port",
            VvmEvent::DataInvalidInitialServerResponse => "data_invalid_initial_server_response",
            VvmEvent::DataSslException => "data_ssl_exception",
            VvmEvent::DataIoeOnOpen => "data_ioe_on_open",
            VvmEvent::DataCannotEstablishConnection => "data_cannot_establish_connection",
            VvmEvent::DataMailboxOpenFailed => "data_mailbox_open_failed",
            VvmEvent::DataGenericImapIoe => "data_generic_imap_ioe",
            VvmEvent::DataBadImapCredential => "data_bad_imap_credential",
            VvmEvent::DataAuthUnknownUser => "data_auth_unknown_user",
            VvmEvent::DataAuthUnknownDevice => "data_auth_unknown_device",
            VvmEvent::DataAuthInvalidPassword => "data_auth_invalid_password",
            VvmEvent::DataAuthMailboxNotInitialized => "data_auth_mailbox_not_initialized",
            VvmEvent::DataAuthServiceNotProvisioned => "data_auth_service_not_provisioned",
            VvmEvent::DataAuthServiceNotActivated => "data_auth_service_not_activated",
            VvmEvent::DataAuthUserIsBlocked => "data_auth_user_is_blocked",
            VvmEvent::DataRejectedServerResponse => "data_rejected_server_response",
        }
    }

    /// Maps the status text of a `NO` answer to LOGIN.
    pub fn from_login_rejection(status_text: &str) -> Self {
        match status_text.trim() {
            NO_UNKNOWN_USER => VvmEvent::DataAuthUnknownUser,
            NO_UNKNOWN_CLIENT => VvmEvent::DataAuthUnknownDevice,
            NO_INVALID_PASSWORD => VvmEvent::DataAuthInvalidPassword,
            NO_MAILBOX_NOT_INITIALIZED => VvmEvent::DataAuthMailboxNotInitialized,
            NO_SERVICE_IS_NOT_PROVISIONED => VvmEvent::DataAuthServiceNotProvisioned,
            NO_SERVICE_IS_NOT_ACTIVATED => VvmEvent::DataAuthServiceNotActivated,
            NO_USER_IS_BLOCKED => VvmEvent::DataAuthUserIsBlocked,
            NO_APPLICATION_ERROR => VvmEvent::DataRejectedServerResponse,
            _ => VvmEvent::DataBadImapCredential,
        }
    }

    /// Configuration state this event moves the account to, if any.
    pub fn configuration_state(&self) -> Option<ConfigurationState> {
        match self {
            VvmEvent::ConfigActivating => Some(ConfigurationState::Configuring),
            VvmEvent::ConfigActivationSucceeded
            | VvmEvent::DataImapOperationStarted
            | VvmEvent::DataImapOperationCompleted => Some(ConfigurationState::Ok),
            VvmEvent::ConfigNotConfigured => Some(ConfigurationState::NotConfigured),
            VvmEvent::ConfigDisabled => Some(ConfigurationState::Disabled),
            _ => None,
        }
    }

    /// Data channel state this event moves the account to, if any.
    pub fn data_channel_state(&self) -> Option<DataChannelState> {
        match self {
            VvmEvent::ConfigActivating
            | VvmEvent::ConfigActivationSucceeded
            | VvmEvent::ConfigNotConfigured
            | VvmEvent::ConfigDisabled => None,

            VvmEvent::DataImapOperationStarted | VvmEvent::DataImapOperationCompleted => {
                Some(DataChannelState::Ok)
            }
            VvmEvent::DataNoConnection => Some(DataChannelState::NoConnection),
            VvmEvent::DataNoConnectionCellularRequired => {
                Some(DataChannelState::NoConnectionCellularRequired)
            }
            VvmEvent::DataInvalidPort => Some(DataChannelState::BadConfiguration),
            VvmEvent::DataInvalidInitialServerResponse
            | VvmEvent::DataSslException
            | VvmEvent::DataIoeOnOpen
            | VvmEvent::DataCannotEstablishConnection => {
                Some(DataChannelState::ServerConnectionError)
            }
            VvmEvent::DataMailboxOpenFailed | VvmEvent::DataGenericImapIoe => {
                Some(DataChannelState::CommunicationError)
            }
            VvmEvent::DataBadImapCredential
            | VvmEvent::DataAuthUnknownUser
            | VvmEvent::DataAuthUnknownDevice
            | VvmEvent::DataAuthInvalidPassword
            | VvmEvent::DataAuthMailboxNotInitialized
            | VvmEvent::DataAuthServiceNotProvisioned
            | VvmEvent::DataAuthServiceNotActivated
            | VvmEvent::DataAuthUserIsBlocked
            | VvmEvent::DataRejectedServerResponse => Some(DataChannelState::ServerError),
        }
    }

    /// Returns true for events that describe a failure.
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            VvmEvent::ConfigActivating
                | VvmEvent::ConfigActivationSucceeded
                | VvmEvent::ConfigDisabled
                | VvmEvent::DataImapOperationStarted
                | VvmEvent::DataImapOperationCompleted
        )
    }
}

impl std::fmt::Display for VvmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_pin_result_mapping() {
        assert_eq!(
            ChangePinResult::from_server_text("password too weak"),
            ChangePinResult::TooWeak
        );
        assert_eq!(
            ChangePinResult::from_server_text("old password mismatch"),
            ChangePinResult::Mismatch
        );
        assert_eq!(
            ChangePinResult::from_server_text("password contains invalid characters"),
            ChangePinResult::InvalidCharacter
        );
        assert_eq!(
            ChangePinResult::from_server_text("something odd"),
            ChangePinResult::SystemError
        );
        assert_eq!(ChangePinResult::from_server_text(""), ChangePinResult::SystemError);
        assert_eq!(ChangePinResult::TooWeak.code(), 3);
        assert_eq!(ChangePinResult::SystemError.code(), 6);
    }

    #[test]
    fn test_login_rejection_mapping() {
        assert_eq!(
            VvmEvent::from_login_rejection("unknown user"),
            VvmEvent::DataAuthUnknownUser
        );
        assert_eq!(
            VvmEvent::from_login_rejection("service is not activated"),
            VvmEvent::DataAuthServiceNotActivated
        );
        assert_eq!(
            VvmEvent::from_login_rejection("application error"),
            VvmEvent::DataRejectedServerResponse
        );
        assert_eq!(
            VvmEvent::from_login_rejection("LOGIN failed"),
            VvmEvent::DataBadImapCredential
        );
    }

    #[test]
    fn test_event_names_are_serde_names() {
        for event in [
            VvmEvent::DataInvalidPort,
            VvmEvent::ConfigActivationSucceeded,
            VvmEvent::DataNoConnectionCellularRequired,
        ] {
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event.as_str()));
        }
    }

    #[test]
    fn test_success_events_are_not_errors() {
        assert!(!VvmEvent::DataImapOperationCompleted.is_error());
        assert!(VvmEvent::DataNoConnection.is_error());
        assert!(VvmEvent::DataAuthUserIsBlocked.is_error());
    }
}
