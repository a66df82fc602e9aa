//! # Error Types
//!
//! Domain-specific error types for vvm-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  vvm-core errors (this file)                                           │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  vvm-db errors (separate crate)                                        │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  vvm-sync errors (separate crate)                                      │
//! │  └── SyncError        - Network, IMAP and scheduling failures          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → VoicemailStatus       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A sync mode string did not name any known action.
    ///
    /// ## When This Occurs
    /// - A trigger carried an action parameter other than `full_sync`,
    ///   `upload_only`, `download_only`, `download_one_transcription`
    ///   or `activate`
    #[error("Unknown sync action: '{0}'")]
    UnknownSyncAction(String),

    /// A single-voicemail action was requested without a target.
    #[error("Action {0} requires a target voicemail")]
    MissingTarget(String),

    /// Stored credentials lack a required OMTP field.
    ///
    /// ## When This Occurs
    /// - The STATUS message that provisioned the account omitted `u`, `pw`,
    ///   `srv` or `ipt`
    #[error("Credential field '{0}' is missing")]
    MissingCredentialField(&'static str),

    /// Input validation failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These are raised before anything is sent to the carrier server.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The IMAP port stored for an account is not a number.
    #[error("Invalid IMAP port: '{0}'")]
    InvalidPort(String),

    /// A required text field is empty.
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    /// PIN contains something other than digits.
    #[error("PIN must contain only digits")]
    PinNotNumeric,

    /// PIN length outside the carrier's accepted range.
    #[error("PIN length {len} outside {min}-{max}")]
    PinLength { len: usize, min: usize, max: usize },

    /// Language code is not a two or three letter ISO 639 code.
    #[error("Invalid language code: '{0}'")]
    InvalidLanguage(String),

    /// A value would break the single-line IMAP command it is spliced into.
    #[error("{field} contains characters not allowed in an IMAP command")]
    UnsafeCommandArgument { field: &'static str },
}
