//! # Sync Triggers
//!
//! The outside events that put work on the scheduler.
//!
//! ```text
//! ┌───────────────────────────┬─────────────────────────────────────────────┐
//! │ Event                     │ Enqueued                                    │
//! ├───────────────────────────┼─────────────────────────────────────────────┤
//! │ sync requested / alarm    │ full_sync per registered account,           │
//! │                           │ activate per enabled unregistered account   │
//! │ local store changed       │ upload_only per registered account          │
//! │                           │ (postponed, bursts collapse)                │
//! │ transcription needed      │ download_one_transcription for one UID      │
//! │ service regained          │ full_sync (see registry listeners)          │
//! └───────────────────────────┴─────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use vvm_core::{AccountHandle, SyncAction};

use crate::config::VvmConfig;
use crate::error::SyncResult;
use crate::registry::SourceRegistry;
use crate::scheduler::{SchedulerHandle, SyncTask};

/// Turns external events into scheduled tasks.
#[derive(Clone)]
pub struct SyncTriggers {
    config: Arc<VvmConfig>,
    registry: SourceRegistry,
    scheduler: SchedulerHandle,
}

impl SyncTriggers {
    pub fn new(config: Arc<VvmConfig>, registry: SourceRegistry, scheduler: SchedulerHandle) -> Self {
        SyncTriggers {
            config,
            registry,
            scheduler,
        }
    }

    /// Full sync for every active source, activation for every enabled
    /// account that is not one yet. Returns the number of tasks queued.
    pub async fn sync_requested(&self) -> SyncResult<usize> {
        let registered = self.registry.accounts().await;
        let mut queued = 0;

        for account in &registered {
            if self
                .scheduler
                .enqueue(SyncTask::new(account.clone(), SyncAction::FullSync))
                .await?
            {
                queued += 1;
            }
        }

        let inactive = self
            .config
            .accounts
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.handle())
            .filter(|a| !registered.contains(a));

        for account in inactive {
            debug!(account = %account, "Enabled account not active, activating");
            if self
                .scheduler
                .enqueue(SyncTask::new(account, SyncAction::Activate))
                .await?
            {
                queued += 1;
            }
        }

        info!(queued, sources = registered.len(), "Sync requested");
        Ok(queued)
    }

    /// Local voicemail rows changed; push them to the server once the
    /// burst is over.
    pub async fn local_change(&self) -> SyncResult<usize> {
        let mut queued = 0;
        for account in self.registry.accounts().await {
            if self
                .scheduler
                .enqueue(SyncTask::new(account, SyncAction::UploadOnly))
                .await?
            {
                queued += 1;
            }
        }
        debug!(queued, "Local change recorded");
        Ok(queued)
    }

    /// Fetches the transcription of one voicemail.
    pub async fn transcription_needed(
        &self,
        account: &AccountHandle,
        source_data: &str,
    ) -> SyncResult<bool> {
        self.scheduler
            .enqueue(SyncTask::for_voicemail(account.clone(), source_data))
            .await
    }

    /// Fires [`sync_requested`](Self::sync_requested) every `period`,
    /// starting one period from now. Stops when the scheduler is gone.
    pub fn spawn_alarm(&self, period: Duration) -> JoinHandle<()> {
        let triggers = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                debug!("Periodic sync alarm");
                if let Err(e) = triggers.sync_requested().await {
                    warn!(?e, "Scheduler unavailable, stopping sync alarm");
                    break;
                }
            }
        })
    }
}
