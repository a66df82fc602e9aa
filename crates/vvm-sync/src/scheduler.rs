//! # Task Scheduler
//!
//! Serializes sync work per account and collapses bursts of upload
//! triggers into one pass.
//!
//! ## Dispatch Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SchedulerHandle ──enqueue──►  pending queue (FIFO)                     │
//! │                                 ┌──────────────────────────────────┐   │
//! │                                 │ sim-1 upload_only  ready +5s     │   │
//! │                                 │ sim-2 full_sync    ready now     │   │
//! │                                 │ sim-1 full_sync    ready now     │   │
//! │                                 └───────────────┬──────────────────┘   │
//! │                                                 │ ready and account    │
//! │                                                 │ not busy             │
//! │                                                 ▼                      │
//! │                                 worker task ──► TaskRunner::run        │
//! │                                                                         │
//! │  RULES:                                                                 │
//! │  • An equivalent task already pending makes enqueue a no-op            │
//! │  • upload_only waits for a quiet window; each new equivalent trigger   │
//! │    restarts the window                                                 │
//! │  • At most one task runs per account; accounts run concurrently        │
//! │  • Pending tasks can be cancelled; running ones always finish          │
//! │  • A failed run is queued again after the retry interval until its     │
//! │    retries are used up; the runner sees how many are left              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vvm_core::{AccountHandle, SyncAction};

use crate::config::SchedulerSettings;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Tasks
// =============================================================================

/// One unit of sync work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    /// Correlation id for logs.
    pub id: Uuid,

    pub account: AccountHandle,

    pub action: SyncAction,

    /// Target voicemail for single-voicemail actions.
    pub source_data: Option<String>,

    /// Attempts the scheduler will still make if this one fails.
    pub retries_left: u32,
}

impl SyncTask {
    pub fn new(account: AccountHandle, action: SyncAction) -> Self {
        SyncTask {
            id: Uuid::new_v4(),
            account,
            action,
            source_data: None,
            retries_left: 0,
        }
    }

    /// Transcription (and prefetch) of one voicemail.
    pub fn for_voicemail(account: AccountHandle, source_data: impl Into<String>) -> Self {
        SyncTask {
            source_data: Some(source_data.into()),
            ..SyncTask::new(account, SyncAction::DownloadOneTranscription)
        }
    }

    /// True if a failure of this run is final and should be reported.
    pub fn is_last_attempt(&self) -> bool {
        self.retries_left == 0
    }

    /// Same account, action and target.
    pub fn is_equivalent(&self, other: &SyncTask) -> bool {
        self.account == other.account
            && self.action == other.action
            && self.source_data == other.source_data
    }
}

/// Executes dispatched tasks.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Runs a task to completion. `Ok(false)` is a failed run that was
    /// already reported.
    async fn run(&self, task: &SyncTask) -> SyncResult<bool>;
}

// =============================================================================
// Handle
// =============================================================================

enum Command {
    Enqueue {
        task: SyncTask,
        reply: oneshot::Sender<bool>,
    },
    CancelAccount {
        account: AccountHandle,
        reply: oneshot::Sender<usize>,
    },
    Pending {
        reply: oneshot::Sender<Vec<SyncTask>>,
    },
    Idle {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Handle for submitting work to the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Queues a task. Returns false if an equivalent task was already
    /// pending (its postpone window, if any, is restarted).
    pub async fn enqueue(&self, task: SyncTask) -> SyncResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue { task, reply }).await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Drops every pending task of an account. Running tasks are not
    /// affected. Returns how many were dropped.
    pub async fn cancel_account(&self, account: &AccountHandle) -> SyncResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CancelAccount {
            account: account.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Tasks waiting for dispatch, in queue order.
    pub async fn pending(&self) -> SyncResult<Vec<SyncTask>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Pending { reply }).await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// True when nothing is pending or running.
    pub async fn is_idle(&self) -> SyncResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Idle { reply }).await?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Stops dispatching; running tasks are awaited.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelError("Scheduler channel closed".into()))
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct PendingTask {
    task: SyncTask,
    ready_at: Instant,
    retries_left: u32,
    retry_interval: Duration,
}

/// A worker that ended, with the next attempt of its task if it failed.
struct Finished {
    account: AccountHandle,
    retry: Option<PendingTask>,
}

/// Frees the account slot when a worker ends, even by panic.
struct Completion {
    account: AccountHandle,
    retry: Option<PendingTask>,
    tx: mpsc::UnboundedSender<Finished>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = self.tx.send(Finished {
            account: self.account.clone(),
            retry: self.retry.take(),
        });
    }
}

/// Task queue actor.
pub struct TaskScheduler {
    rx: mpsc::Receiver<Command>,
    postpone: Duration,
    tolerance: Duration,
    retry_count: u32,
    retry_interval: Duration,
    pending: VecDeque<PendingTask>,
    running: HashSet<AccountHandle>,
    done_tx: mpsc::UnboundedSender<Finished>,
    done_rx: mpsc::UnboundedReceiver<Finished>,
}

impl TaskScheduler {
    /// Creates the scheduler and its handle.
    ///
    /// The handle works before [`run`](Self::run) is called, so components
    /// the runner depends on can be built with it first.
    pub fn new(settings: &SchedulerSettings) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(256);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let scheduler = TaskScheduler {
            rx,
            postpone: Duration::from_millis(settings.upload_postpone_ms),
            tolerance: Duration::from_millis(settings.ready_tolerance_ms),
            retry_count: settings.retry_count,
            retry_interval: Duration::from_millis(settings.retry_interval_ms),
            pending: VecDeque::new(),
            running: HashSet::new(),
            done_tx,
            done_rx,
        };

        (scheduler, SchedulerHandle { tx })
    }

    /// Runs the dispatch loop until shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self, runner: Arc<dyn TaskRunner>) {
        info!(
            postpone_ms = self.postpone.as_millis() as u64,
            retry_count = self.retry_count,
            retry_interval_ms = self.retry_interval.as_millis() as u64,
            "Task scheduler starting"
        );

        loop {
            self.dispatch_ready(&runner);
            let deadline = self.next_deadline();

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },

                Some(finished) = self.done_rx.recv() => self.finish(finished),

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }

        info!(
            dropped = self.pending.len(),
            running = self.running.len(),
            "Task scheduler shutting down"
        );
        self.pending.clear();
        while !self.running.is_empty() {
            match self.done_rx.recv().await {
                Some(finished) => {
                    self.running.remove(&finished.account);
                }
                None => break,
            }
        }
        info!("Task scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { task, reply } => {
                let _ = reply.send(self.enqueue(task));
            }
            Command::CancelAccount { account, reply } => {
                let before = self.pending.len();
                self.pending.retain(|p| p.task.account != account);
                let cancelled = before - self.pending.len();
                if cancelled > 0 {
                    info!(account = %account, cancelled, "Pending tasks cancelled");
                }
                let _ = reply.send(cancelled);
            }
            Command::Pending { reply } => {
                let _ = reply.send(self.pending.iter().map(|p| p.task.clone()).collect());
            }
            Command::Idle { reply } => {
                let _ = reply.send(self.pending.is_empty() && self.running.is_empty());
            }
            Command::Shutdown => {}
        }
    }

    fn enqueue(&mut self, task: SyncTask) -> bool {
        let postponed = task.action.is_postponed();
        let now = Instant::now();

        if let Some(existing) = self.pending.iter_mut().find(|p| p.task.is_equivalent(&task)) {
            if postponed {
                existing.ready_at = now + self.postpone;
                debug!(
                    account = %task.account,
                    action = %task.action,
                    "Postpone window restarted"
                );
            }
            return false;
        }

        let ready_at = if postponed { now + self.postpone } else { now };
        debug!(task_id = %task.id, account = %task.account, action = %task.action, "Task queued");
        self.pending.push_back(PendingTask {
            task,
            ready_at,
            retries_left: self.retry_count,
            retry_interval: self.retry_interval,
        });
        true
    }

    /// Frees the account and queues the next attempt of a failed task.
    ///
    /// The retry is dropped if an equivalent task was queued meanwhile.
    fn finish(&mut self, finished: Finished) {
        self.running.remove(&finished.account);

        let Some(retry) = finished.retry else {
            return;
        };
        if self.pending.iter().any(|p| p.task.is_equivalent(&retry.task)) {
            debug!(task_id = %retry.task.id, "Retry superseded by a pending task");
            return;
        }
        self.pending.push_back(retry);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .filter(|p| !self.running.contains(&p.task.account))
            .map(|p| p.ready_at)
            .min()
    }

    fn dispatch_ready(&mut self, runner: &Arc<dyn TaskRunner>) {
        let horizon = Instant::now() + self.tolerance;
        let mut index = 0;

        while index < self.pending.len() {
            let entry = &self.pending[index];
            if entry.ready_at > horizon || self.running.contains(&entry.task.account) {
                index += 1;
                continue;
            }
            if let Some(entry) = self.pending.remove(index) {
                self.spawn(entry, runner.clone());
            }
        }
    }

    fn spawn(&mut self, entry: PendingTask, runner: Arc<dyn TaskRunner>) {
        let PendingTask {
            mut task,
            retries_left,
            retry_interval,
            ..
        } = entry;
        task.retries_left = retries_left;

        self.running.insert(task.account.clone());
        let mut completion = Completion {
            account: task.account.clone(),
            retry: None,
            tx: self.done_tx.clone(),
        };

        tokio::spawn(async move {
            info!(
                task_id = %task.id,
                account = %task.account,
                action = %task.action,
                retries_left,
                "Task started"
            );

            let succeeded = match runner.run(&task).await {
                Ok(true) => {
                    info!(task_id = %task.id, "Task completed");
                    true
                }
                Ok(false) => {
                    warn!(task_id = %task.id, action = %task.action, "Task failed");
                    false
                }
                Err(e) => {
                    error!(task_id = %task.id, action = %task.action, ?e, "Task error");
                    false
                }
            };

            if !succeeded && retries_left > 0 {
                info!(
                    task_id = %task.id,
                    retries_left = retries_left - 1,
                    retry_in_ms = retry_interval.as_millis() as u64,
                    "Task will be retried"
                );
                completion.retry = Some(PendingTask {
                    task,
                    ready_at: Instant::now() + retry_interval,
                    retries_left: retries_left - 1,
                    retry_interval,
                });
            }
        });
    }
}
