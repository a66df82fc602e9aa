//! In-memory mailbox and store helpers for engine tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vvm_core::{
    AccountHandle, ChangePinResult, ImapCredentials, Quota, SyncAction, VoicemailPayload,
    VoicemailStatus,
};
use vvm_db::{Database, DbConfig};

use crate::config::{CarrierConfig, SchedulerSettings};
use crate::error::{SyncError, SyncResult};
use crate::imap::{BodyPart, Flag, FolderInfo, FolderMode, RemoteMessage, StructureOutcome};
use crate::mailbox::{Mailbox, MailboxConnector};
use crate::network::NetworkLease;
use crate::scheduler::{SchedulerHandle, SyncTask, TaskRunner, TaskScheduler};
use crate::status::StatusEmitter;

pub async fn memory_db() -> Arc<Database> {
    Arc::new(Database::new(DbConfig::in_memory()).await.unwrap())
}

pub fn credentials() -> ImapCredentials {
    ImapCredentials {
        username: "5551234".into(),
        password: "secret".into(),
        server: "vvm.example".into(),
        port: "143".into(),
    }
}

pub struct FakeMessage {
    pub remote: RemoteMessage,
    pub transcription: Option<String>,
    pub audio: Vec<u8>,
}

/// A voicemail with an audio part, sent at `minute` past 2024-03-05 10:00.
pub fn message(uid: &str, seen: bool, minute: u32) -> FakeMessage {
    FakeMessage {
        remote: RemoteMessage {
            uid: uid.to_string(),
            seen,
            deleted: false,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 10, minute, 0).unwrap(),
            number: Some("5559876".into()),
            duration: Some(12),
            audio: BodyPart {
                part_id: "2".into(),
                mime_type: "audio/amr".into(),
                encoding: "base64".into(),
                size: 4,
            },
            transcription: Some(BodyPart {
                part_id: "1".into(),
                mime_type: "text/plain".into(),
                encoding: "7bit".into(),
                size: 10,
            }),
        },
        transcription: None,
        audio: format!("amr-{}", uid).into_bytes(),
    }
}

/// Shared state of a [`FakeMailbox`], inspectable after the mailbox is gone.
#[derive(Default)]
pub struct FakeState {
    pub messages: BTreeMap<String, FakeMessage>,
    /// UIDs whose structure fetch fails with an I/O error.
    pub unreachable: HashSet<String>,
    /// UIDs the server lists but returns no structure for.
    pub missing: HashSet<String>,
    /// UIDs that are not voicemails.
    pub not_voicemail: HashSet<String>,
    pub fail_open: bool,
    pub fail_list: bool,
    pub fail_quota: bool,
    pub fail_flags: Vec<Flag>,
    /// Mailbox capacity; `None` means no quota support.
    pub quota_total: Option<i64>,
    pub pin_result: Option<ChangePinResult>,
    pub commands: Vec<String>,
    pub body_fetches: usize,
    pub connects: usize,
    pub closes: usize,
}

impl FakeState {
    pub fn with_messages(messages: Vec<FakeMessage>) -> Arc<Mutex<FakeState>> {
        Arc::new(Mutex::new(FakeState {
            messages: messages
                .into_iter()
                .map(|m| (m.remote.uid.clone(), m))
                .collect(),
            ..Default::default()
        }))
    }

    fn live(&self) -> impl Iterator<Item = &FakeMessage> {
        self.messages.values().filter(|m| !m.remote.deleted)
    }
}

pub struct FakeMailbox {
    state: Arc<Mutex<FakeState>>,
}

impl FakeMailbox {
    pub fn new(state: Arc<Mutex<FakeState>>) -> Self {
        FakeMailbox { state }
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn open_folder(&mut self, mode: FolderMode) -> SyncResult<Option<FolderInfo>> {
        let state = self.state.lock().unwrap();
        if state.fail_open {
            return Ok(None);
        }
        Ok(Some(FolderInfo {
            mode,
            message_count: state.live().count() as i64,
        }))
    }

    async fn list_messages(&mut self) -> SyncResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(SyncError::Io("connection reset".into()));
        }
        Ok(state.live().map(|m| m.remote.uid.clone()).collect())
    }

    async fn find_message(&mut self, uid: &str) -> SyncResult<Option<String>> {
        let state = self.state.lock().unwrap();
        let found = state
            .live()
            .find(|m| m.remote.uid == uid)
            .map(|m| m.remote.uid.clone());
        Ok(found)
    }

    async fn fetch_structure(&mut self, uid: &str) -> SyncResult<StructureOutcome> {
        let state = self.state.lock().unwrap();
        if state.unreachable.contains(uid) {
            return Err(SyncError::Io("connection reset".into()));
        }
        if state.missing.contains(uid) {
            return Ok(StructureOutcome::Missing);
        }
        if state.not_voicemail.contains(uid) {
            return Ok(StructureOutcome::NotVoicemail("not multipart".into()));
        }
        Ok(match state.messages.get(uid) {
            Some(m) => StructureOutcome::Voicemail(m.remote.clone()),
            None => StructureOutcome::Missing,
        })
    }

    async fn fetch_body(&mut self, message: &RemoteMessage) -> SyncResult<Option<VoicemailPayload>> {
        let mut state = self.state.lock().unwrap();
        state.body_fetches += 1;
        Ok(state.messages.get(&message.uid).map(|m| VoicemailPayload {
            mime_type: m.remote.audio.mime_type.clone(),
            data: m.audio.clone(),
        }))
    }

    async fn fetch_transcription(&mut self, message: &RemoteMessage) -> SyncResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .get(&message.uid)
            .and_then(|m| m.transcription.clone()))
    }

    async fn set_flags(&mut self, uids: &[String], flag: Flag, value: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        state
            .commands
            .push(format!("STORE {} {} {}", uids.join(","), flag, value));
        if state.fail_flags.contains(&flag) {
            return false;
        }
        for uid in uids {
            if let Some(m) = state.messages.get_mut(uid) {
                match flag {
                    Flag::Seen => m.remote.seen = value,
                    Flag::Deleted => m.remote.deleted = value,
                }
            }
        }
        true
    }

    async fn change_pin(&mut self, old_pin: &str, new_pin: &str) -> SyncResult<ChangePinResult> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(format!("PIN {} {}", old_pin, new_pin));
        Ok(state.pin_result.unwrap_or(ChangePinResult::Success))
    }

    async fn change_language(&mut self, language: &str) -> SyncResult<()> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(format!("LANG {}", language));
        Ok(())
    }

    async fn close_tutorial(&mut self) -> SyncResult<()> {
        self.state.lock().unwrap().commands.push("CLOSE_NUT".into());
        Ok(())
    }

    async fn get_quota(&mut self) -> SyncResult<Option<Quota>> {
        let state = self.state.lock().unwrap();
        if state.fail_quota {
            return Err(SyncError::Io("connection reset".into()));
        }
        Ok(state
            .quota_total
            .map(|total| Quota::new(state.live().count() as i64, total)))
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.messages.retain(|_, m| !m.remote.deleted);
        state.closes += 1;
    }
}

pub struct FakeConnector {
    pub state: Arc<Mutex<FakeState>>,
}

impl MailboxConnector for FakeConnector {
    fn connect(
        &self,
        _account: &AccountHandle,
        _credentials: ImapCredentials,
        _carrier: &CarrierConfig,
        _lease: &NetworkLease,
    ) -> Box<dyn Mailbox> {
        self.state.lock().unwrap().connects += 1;
        Box::new(FakeMailbox::new(self.state.clone()))
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Runner that only records what the scheduler dispatched.
#[derive(Default)]
pub struct RecordingRunner {
    pub runs: Mutex<Vec<SyncTask>>,
}

impl RecordingRunner {
    pub fn actions(&self) -> Vec<(AccountHandle, SyncAction)> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .map(|t| (t.account.clone(), t.action))
            .collect()
    }

    /// Waits up to two seconds for `count` dispatched tasks.
    pub async fn wait_for(&self, count: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.runs.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(&self, task: &SyncTask) -> SyncResult<bool> {
        self.runs.lock().unwrap().push(task.clone());
        Ok(true)
    }
}

/// A running scheduler with no upload postpone window.
pub fn recording_scheduler() -> (SchedulerHandle, Arc<RecordingRunner>) {
    let settings = SchedulerSettings {
        upload_postpone_ms: 0,
        ready_tolerance_ms: 0,
        ..Default::default()
    };
    let (scheduler, handle) = TaskScheduler::new(&settings);
    let runner = Arc::new(RecordingRunner::default());
    tokio::spawn(scheduler.run(runner.clone()));
    (handle, runner)
}

// =============================================================================
// Status
// =============================================================================

/// Emitter keeping the event of every status change, in order.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<String>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusEmitter for RecordingEmitter {
    fn emit_status(&self, status: &VoicemailStatus) {
        if let Some(event) = &status.last_event {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn emit_error(&self, _account: &AccountHandle, _message: &str, _retryable: bool) {}
}
