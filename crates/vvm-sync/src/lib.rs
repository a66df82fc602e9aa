//! # vvm-sync: OMTP Visual Voicemail Sync Engine
//!
//! Keeps the local voicemail store consistent with the carrier's IMAP
//! voicemail box.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Engine Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  SyncTriggers   sync requested · local change · alarm            │  │
//! │  │  SourceRegistry listeners   service regained                     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ enqueue                                 │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  TaskScheduler   one task per account, upload postpone window    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ dispatch                                │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  SyncOrchestrator                                                │  │
//! │  │    NetworkManager ──► NetworkLease                               │  │
//! │  │    MailboxConnector ──► ImapTransport                            │  │
//! │  │    ReconciliationEngine ──► vvm-db voicemail store               │  │
//! │  │    StatusReporter ──► VoicemailStatus + StatusEmitter            │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - Engine and per-carrier configuration
//! - [`error`] - Sync error types
//! - [`network`] - Connectivity state and network leases
//! - [`imap`] - IMAP client on async-imap: connection, DIGEST-MD5, folder queries, transport
//! - [`mailbox`] - Mailbox seam between the engine and the transport
//! - [`reconcile`] - Upload / download reconciliation
//! - [`scheduler`] - Task queue with per-account serialization
//! - [`registry`] - Active voicemail sources and their listeners
//! - [`activation`] - Turning enabled accounts into sources
//! - [`orchestrator`] - Task execution, on-demand fetch, carrier commands
//! - [`triggers`] - External events to tasks
//! - [`status`] - Status events and host notification
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vvm_sync::{SyncOrchestratorBuilder, SyncTriggers, TaskScheduler, VvmConfig};
//!
//! let config = Arc::new(VvmConfig::load(None)?);
//! let (scheduler, handle) = TaskScheduler::new(&config.scheduler);
//!
//! let orchestrator = SyncOrchestratorBuilder::new(config.clone())
//!     .with_database(db)
//!     .with_scheduler(handle.clone())
//!     .build()?;
//! let triggers = SyncTriggers::new(config, orchestrator.registry().clone(), handle);
//!
//! tokio::spawn(scheduler.run(Arc::new(orchestrator)));
//! triggers.sync_requested().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod activation;
pub mod config;
pub mod error;
pub mod imap;
pub mod mailbox;
pub mod network;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod triggers;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use activation::Activator;
pub use config::{AccountConfig, CarrierCommands, CarrierConfig, VvmConfig};
pub use error::{SyncError, SyncResult};
pub use imap::ImapTransport;
pub use mailbox::{ImapConnector, Mailbox, MailboxConnector};
pub use network::{NetworkKind, NetworkLease, NetworkManager, NetworkRequest, NetworkState};
pub use orchestrator::{SyncOrchestrator, SyncOrchestratorBuilder};
pub use reconcile::{DownloadReport, ReconciliationEngine, UploadReport};
pub use registry::SourceRegistry;
pub use scheduler::{SchedulerHandle, SyncTask, TaskRunner, TaskScheduler};
pub use status::{NoOpEmitter, StatusEmitter, StatusReporter};
pub use triggers::SyncTriggers;
