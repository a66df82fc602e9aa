//! # vvm-core: Pure Domain Types for Visual Voicemail
//!
//! This crate holds the vocabulary shared by the storage layer and the sync
//! engine. Nothing in here performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   apps/vvmd ──► vvm-sync ──► vvm-db ──► vvm-core (you are here)        │
//! │                    │                        ▲                           │
//! │                    └────────────────────────┘                           │
//! │                                                                         │
//! │   vvm-core: Voicemail, VoicemailStatus, Quota, SyncAction,             │
//! │             VvmEvent, ChangePinResult, ImapCredentials                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Voicemail, VoicemailStatus, Quota, etc.)
//! - [`omtp`] - OMTP protocol constants, PIN-change results, status events
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation (PIN, language, credentials)
//!
//! ## Example Usage
//!
//! ```rust
//! use vvm_core::omtp::ChangePinResult;
//!
//! let result = ChangePinResult::from_server_text("password too weak");
//! assert_eq!(result, ChangePinResult::TooWeak);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod omtp;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ValidationError};
pub use omtp::{ChangePinResult, VvmEvent};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Mailbox folder every OMTP server stores voicemails in.
pub const INBOX: &str = "INBOX";

/// Fraction of the remote quota above which old voicemails are archived
/// locally and removed from the server.
pub const AUTO_ARCHIVE_THRESHOLD: f64 = 0.75;
