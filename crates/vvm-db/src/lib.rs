//! # vvm-db: Local Voicemail Store
//!
//! SQLite storage for the voicemail sync engine, accessed through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  vvm-sync (reconciliation, status reporting, activation)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     vvm-db (THIS CRATE)                         │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌──────────────────┐   ┌──────────────┐ │   │
//! │  │   │   Database    │    │   Repositories   │   │  Migrations  │ │   │
//! │  │   │   (pool.rs)   │◄───│ VoicemailRepo    │   │  (embedded)  │ │   │
//! │  │   │  SqlitePool   │    │ StatusRepo       │   │ 001_init.sql │ │   │
//! │  │   │               │    │ CredentialsRepo  │   │              │ │   │
//! │  │   └───────────────┘    └──────────────────┘   └──────────────┘ │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (WAL)                                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vvm_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("vvm.db")).await?;
//! let pending = db.voicemails().read_voicemails(&account).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::credentials::CredentialsRepository;
pub use repository::status::StatusRepository;
pub use repository::voicemail::VoicemailRepository;
