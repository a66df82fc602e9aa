//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ReconciliationEngine / StatusReporter / activation                    │
//! │       │                                                                 │
//! │       │  db.voicemails().read_voicemails(&account)                     │
//! │       ▼                                                                 │
//! │  VoicemailRepository    - local voicemail rows, payloads, flags        │
//! │  StatusRepository       - per-account status + quota                   │
//! │  CredentialsRepository  - OMTP u / pw / srv / ipt                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite                                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every voicemail query is scoped to one account.

pub mod credentials;
pub mod status;
pub mod voicemail;
