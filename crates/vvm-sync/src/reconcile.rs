//! # Reconciliation Engine
//!
//! Converges the local voicemail store with the remote mailbox of one
//! account. `source_data` (the server UID) is the only join key; neither side
//! is assumed to be ordered or of equal size.
//!
//! ## Phases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  UPLOAD (local → remote)                                                │
//! │    deleted rows ──STORE +\Deleted──► ok? ──► delete rows                │
//! │    read rows    ──STORE +\Seen─────► ok? ──► mark rows clean            │
//! │    the batches are independent; success = both ok (or empty)           │
//! │                                                                         │
//! │  DOWNLOAD (remote → local)                                              │
//! │    local rows ◄── all_voicemails          both must succeed before      │
//! │    remote map ◄── SEARCH + structure      anything is mutated           │
//! │                                                                         │
//! │    for each local row:                                                  │
//! │      unresolved UID      → untouched                                    │
//! │      missing remotely    → delete (archived rows are kept)              │
//! │      read state differs  → take remote state (unless a read is pending) │
//! │      transcription       → backfill only when local has none            │
//! │    remaining remote      → insert, prefetch audio if allowed            │
//! │                                                                         │
//! │  SINGLE (one UID)                                                       │
//! │    prefetch audio if allowed, then fetch and store the transcription    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A message the server answers for without a usable structure is
//! unresolved: it is neither inserted nor treated as gone. A connection that
//! breaks during the listing fails the whole download before any row is
//! touched.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use vvm_core::{AccountHandle, Voicemail};
use vvm_db::VoicemailRepository;

use crate::error::SyncResult;
use crate::imap::{Flag, RemoteMessage, StructureOutcome};
use crate::mailbox::Mailbox;

// =============================================================================
// Remote Listing
// =============================================================================

/// One valid remote voicemail.
#[derive(Debug, Clone)]
pub struct RemoteVoicemail {
    pub message: RemoteMessage,
    pub transcription: Option<String>,
}

/// Everything the download phase learned about the remote mailbox.
#[derive(Debug, Default)]
pub struct RemoteListing {
    /// Valid voicemails keyed by UID.
    pub voicemails: HashMap<String, RemoteVoicemail>,

    /// UIDs listed by the server whose structure could not be fetched.
    pub unresolved: HashSet<String>,

    /// UIDs fetched but discarded as not being voicemails.
    pub discarded: usize,
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub deleted: usize,
    pub marked_read: usize,
    pub success: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub inserted: usize,
    pub removed: usize,
    pub read_state_updated: usize,
    pub transcriptions: usize,
    pub payloads: usize,
    pub unresolved: usize,
}

impl DownloadReport {
    /// Returns true if the pass changed nothing locally.
    pub fn is_noop(&self) -> bool {
        self.inserted == 0
            && self.removed == 0
            && self.read_state_updated == 0
            && self.transcriptions == 0
            && self.payloads == 0
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Applies one account's local/remote diff.
pub struct ReconciliationEngine {
    account: AccountHandle,
    store: VoicemailRepository,
    prefetch: bool,
}

impl ReconciliationEngine {
    /// `prefetch` is the carrier's prefetch policy already combined with
    /// the roaming state of the lease.
    pub fn new(account: AccountHandle, store: VoicemailRepository, prefetch: bool) -> Self {
        ReconciliationEngine {
            account,
            store,
            prefetch,
        }
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Pushes local deletions and reads to the server.
    pub async fn upload(&self, mailbox: &mut dyn Mailbox) -> SyncResult<UploadReport> {
        let deleted = self.store.deleted_voicemails(&self.account).await?;
        let read = self.store.read_voicemails(&self.account).await?;
        let mut report = UploadReport {
            success: true,
            ..Default::default()
        };

        if !deleted.is_empty() {
            let (ids, uids) = split_keys(&deleted);
            if mailbox.set_flags(&uids, Flag::Deleted, true).await {
                self.store.delete(&ids).await?;
                report.deleted = ids.len();
            } else {
                warn!(account = %self.account, count = uids.len(), "Deletions not acknowledged");
                report.success = false;
            }
        }

        if !read.is_empty() {
            let (ids, uids) = split_keys(&read);
            if mailbox.set_flags(&uids, Flag::Seen, true).await {
                self.store.mark_clean(&ids).await?;
                report.marked_read = ids.len();
            } else {
                warn!(account = %self.account, count = uids.len(), "Reads not acknowledged");
                report.success = false;
            }
        }

        info!(
            account = %self.account,
            deleted = report.deleted,
            marked_read = report.marked_read,
            success = report.success,
            "Upload finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Download
    // =========================================================================

    /// Pulls remote state into the local store.
    ///
    /// Fails without touching the store if either side cannot be listed.
    pub async fn download(&self, mailbox: &mut dyn Mailbox) -> SyncResult<DownloadReport> {
        let local = self.store.all_voicemails(&self.account).await?;
        let transcribed: HashSet<&str> = local
            .iter()
            .filter(|vm| vm.has_transcription())
            .map(|vm| vm.source_data.as_str())
            .collect();

        let listing = self
            .fetch_remote(mailbox, |uid| !transcribed.contains(uid))
            .await?;

        let mut report = DownloadReport {
            unresolved: listing.unresolved.len(),
            ..Default::default()
        };
        let mut remote = listing.voicemails;

        for voicemail in &local {
            let Some(id) = voicemail.id else {
                continue;
            };
            if listing.unresolved.contains(&voicemail.source_data) {
                debug!(uid = %voicemail.source_data, "Unresolved remotely, leaving as is");
                continue;
            }

            let Some(found) = remote.remove(&voicemail.source_data) else {
                if self.store.delete_non_archived(id).await? {
                    report.removed += 1;
                }
                continue;
            };

            let pending_read = voicemail.is_read && voicemail.is_dirty;
            if voicemail.is_read != found.message.seen && !pending_read {
                self.store.set_read(id, found.message.seen).await?;
                report.read_state_updated += 1;
            }

            if !voicemail.has_transcription() {
                if let Some(text) = found.transcription.as_deref().filter(|t| !t.is_empty()) {
                    self.store.update_transcription(id, text).await?;
                    report.transcriptions += 1;
                }
            }
        }

        for (uid, found) in remote {
            let message = &found.message;
            let voicemail = Voicemail::for_insertion(
                self.account.clone(),
                uid,
                message.timestamp,
                message.number.clone(),
            )
            .with_read(message.seen)
            .with_duration(message.duration)
            .with_transcription(found.transcription.clone());

            let id = self.store.insert(&voicemail).await?;
            report.inserted += 1;

            if self.prefetch && self.prefetch_payload(mailbox, id, message).await {
                report.payloads += 1;
            }
        }

        info!(
            account = %self.account,
            inserted = report.inserted,
            removed = report.removed,
            read_state_updated = report.read_state_updated,
            transcriptions = report.transcriptions,
            unresolved = report.unresolved,
            "Download finished"
        );
        Ok(report)
    }

    /// Lists the mailbox and classifies every message.
    ///
    /// Transcriptions are fetched only for UIDs accepted by
    /// `wants_transcription`.
    pub async fn fetch_remote(
        &self,
        mailbox: &mut dyn Mailbox,
        wants_transcription: impl Fn(&str) -> bool,
    ) -> SyncResult<RemoteListing> {
        let uids = mailbox.list_messages().await?;
        let mut listing = RemoteListing::default();

        for uid in uids {
            let message = match mailbox.fetch_structure(&uid).await {
                Ok(StructureOutcome::Voicemail(message)) => message,
                Ok(StructureOutcome::NotVoicemail(reason)) => {
                    debug!(uid = %uid, reason = %reason, "Skipping non-voicemail message");
                    listing.discarded += 1;
                    continue;
                }
                Ok(StructureOutcome::Missing) => {
                    warn!(uid = %uid, "No structure returned");
                    listing.unresolved.insert(uid);
                    continue;
                }
                Err(e) if e.is_protocol_error() => {
                    warn!(uid = %uid, ?e, "Structure fetch failed");
                    listing.unresolved.insert(uid);
                    continue;
                }
                Err(e) => {
                    warn!(uid = %uid, ?e, "Connection lost while listing");
                    return Err(e);
                }
            };

            if message.deleted {
                continue;
            }

            let mut transcription = None;
            if message.transcription.is_some() && wants_transcription(uid.as_str()) {
                match mailbox.fetch_transcription(&message).await {
                    Ok(text) => transcription = text,
                    Err(e) if e.is_protocol_error() => {
                        warn!(uid = %uid, ?e, "Transcription fetch failed");
                    }
                    Err(e) => {
                        warn!(uid = %uid, ?e, "Connection lost while listing");
                        return Err(e);
                    }
                }
            }

            listing.voicemails.insert(
                uid,
                RemoteVoicemail {
                    message,
                    transcription,
                },
            );
        }

        Ok(listing)
    }

    // =========================================================================
    // Single Voicemail
    // =========================================================================

    /// Fetches the transcription (and audio, if prefetching) of one
    /// voicemail. Returns false if either side does not know the UID.
    pub async fn download_one(&self, mailbox: &mut dyn Mailbox, source_data: &str) -> SyncResult<bool> {
        let Some(voicemail) = self
            .store
            .find_by_source_data(&self.account, source_data)
            .await?
        else {
            warn!(account = %self.account, uid = %source_data, "Voicemail not stored locally");
            return Ok(false);
        };
        let Some(id) = voicemail.id else {
            return Ok(false);
        };

        if mailbox.find_message(source_data).await?.is_none() {
            warn!(account = %self.account, uid = %source_data, "Voicemail not on server");
            return Ok(false);
        }

        let StructureOutcome::Voicemail(message) = mailbox.fetch_structure(source_data).await?
        else {
            return Ok(false);
        };

        if self.prefetch && !voicemail.has_content {
            self.prefetch_payload(mailbox, id, &message).await;
        }

        if let Some(text) = mailbox.fetch_transcription(&message).await? {
            self.store.update_transcription(id, &text).await?;
            debug!(account = %self.account, uid = %source_data, "Transcription stored");
        }
        Ok(true)
    }

    async fn prefetch_payload(&self, mailbox: &mut dyn Mailbox, id: i64, message: &RemoteMessage) -> bool {
        match mailbox.fetch_body(message).await {
            Ok(Some(payload)) => match self.store.save_payload(id, &payload).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(uid = %message.uid, ?e, "Failed to cache payload");
                    false
                }
            },
            Ok(None) => {
                warn!(uid = %message.uid, "Server returned no audio");
                false
            }
            Err(e) => {
                warn!(uid = %message.uid, ?e, "Audio prefetch failed");
                false
            }
        }
    }
}

fn split_keys(voicemails: &[Voicemail]) -> (Vec<i64>, Vec<String>) {
    voicemails
        .iter()
        .filter_map(|vm| vm.id.map(|id| (id, vm.source_data.clone())))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, message, FakeMailbox, FakeState};
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};
    use vvm_db::Database;

    fn account() -> AccountHandle {
        AccountHandle::new("sim-1")
    }

    async fn insert(db: &Database, uid: &str, is_read: bool) -> i64 {
        let vm = Voicemail::for_insertion(
            account(),
            uid,
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            Some("5550000".into()),
        )
        .with_read(is_read);
        db.voicemails().insert(&vm).await.unwrap()
    }

    fn setup(db: &Database, state: &Arc<Mutex<FakeState>>, prefetch: bool) -> (ReconciliationEngine, FakeMailbox) {
        (
            ReconciliationEngine::new(account(), db.voicemails(), prefetch),
            FakeMailbox::new(state.clone()),
        )
    }

    async fn stored(db: &Database, uid: &str) -> Option<Voicemail> {
        db.voicemails()
            .find_by_source_data(&account(), uid)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_remote_read_state_wins() {
        let db = memory_db().await;
        insert(&db, "42", false).await;
        let state = FakeState::with_messages(vec![message("42", true, 0)]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        engine.download(&mut mailbox).await.unwrap();

        let vm = stored(&db, "42").await.unwrap();
        assert!(vm.is_read);
    }

    #[tokio::test]
    async fn test_missing_remote_is_deleted_locally() {
        let db = memory_db().await;
        insert(&db, "7", false).await;
        let state = FakeState::with_messages(vec![]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        let report = engine.download(&mut mailbox).await.unwrap();

        assert_eq!(report.removed, 1);
        assert!(stored(&db, "7").await.is_none());
    }

    #[tokio::test]
    async fn test_archived_rows_survive_remote_removal() {
        let db = memory_db().await;
        let id = insert(&db, "7", true).await;
        db.voicemails().mark_archived(&[id]).await.unwrap();
        let state = FakeState::with_messages(vec![]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        engine.download(&mut mailbox).await.unwrap();

        assert!(stored(&db, "7").await.unwrap().is_archived);
    }

    #[tokio::test]
    async fn test_new_messages_inserted_with_prefetch() {
        let db = memory_db().await;
        let mut incoming = message("9", false, 30);
        incoming.transcription = Some("call me back".into());
        let state = FakeState::with_messages(vec![incoming, message("10", true, 31)]);
        let (engine, mut mailbox) = setup(&db, &state, true);

        let report = engine.download(&mut mailbox).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.payloads, 2);

        let vm = stored(&db, "9").await.unwrap();
        assert_eq!(vm.number.as_deref(), Some("5559876"));
        assert_eq!(vm.duration, Some(12));
        assert_eq!(vm.transcription.as_deref(), Some("call me back"));
        assert!(vm.has_content);
        assert!(!vm.is_read);

        let payload = db.voicemails().payload(vm.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(payload.data, b"amr-9");
        assert!(stored(&db, "10").await.unwrap().is_read);
    }

    #[tokio::test]
    async fn test_no_prefetch_leaves_audio_remote() {
        let db = memory_db().await;
        let state = FakeState::with_messages(vec![message("9", false, 30)]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        engine.download(&mut mailbox).await.unwrap();

        assert_eq!(state.lock().unwrap().body_fetches, 0);
        assert!(!stored(&db, "9").await.unwrap().has_content);
    }

    #[tokio::test]
    async fn test_second_download_is_noop() {
        let db = memory_db().await;
        insert(&db, "1", false).await;
        insert(&db, "2", true).await;
        let mut with_text = message("3", false, 5);
        with_text.transcription = Some("hello".into());
        let state = FakeState::with_messages(vec![
            message("1", true, 1),
            message("2", true, 2),
            with_text,
        ]);
        let (engine, mut mailbox) = setup(&db, &state, true);

        let first = engine.download(&mut mailbox).await.unwrap();
        assert!(!first.is_noop());

        let second = engine.download(&mut mailbox).await.unwrap();
        assert!(second.is_noop(), "{:?}", second);
    }

    #[tokio::test]
    async fn test_transcription_never_cleared() {
        let db = memory_db().await;
        let id = insert(&db, "5", false).await;
        db.voicemails().update_transcription(id, "kept").await.unwrap();

        let mut remote = message("5", false, 0);
        remote.transcription = Some(String::new());
        let state = FakeState::with_messages(vec![remote]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        engine.download(&mut mailbox).await.unwrap();

        assert_eq!(stored(&db, "5").await.unwrap().transcription.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_transcription_backfilled() {
        let db = memory_db().await;
        insert(&db, "5", false).await;
        let mut remote = message("5", false, 0);
        remote.transcription = Some("arrived later".into());
        let state = FakeState::with_messages(vec![remote]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        let report = engine.download(&mut mailbox).await.unwrap();

        assert_eq!(report.transcriptions, 1);
        assert_eq!(
            stored(&db, "5").await.unwrap().transcription.as_deref(),
            Some("arrived later")
        );
    }

    #[tokio::test]
    async fn test_listing_failure_mutates_nothing() {
        let db = memory_db().await;
        insert(&db, "7", false).await;
        let state = FakeState::with_messages(vec![]);
        state.lock().unwrap().fail_list = true;
        let (engine, mut mailbox) = setup(&db, &state, false);

        assert!(engine.download(&mut mailbox).await.is_err());
        assert!(stored(&db, "7").await.is_some());
    }

    #[tokio::test]
    async fn test_unresolved_messages_left_untouched() {
        let db = memory_db().await;
        insert(&db, "1", false).await;
        insert(&db, "2", false).await;
        let state = FakeState::with_messages(vec![message("1", true, 1), message("2", true, 2)]);
        state.lock().unwrap().missing.insert("2".into());
        let (engine, mut mailbox) = setup(&db, &state, false);

        let report = engine.download(&mut mailbox).await.unwrap();

        assert_eq!(report.unresolved, 1);
        assert_eq!(report.removed, 0);
        assert!(stored(&db, "1").await.unwrap().is_read);
        assert!(!stored(&db, "2").await.unwrap().is_read);
    }

    #[tokio::test]
    async fn test_connection_lost_while_listing_mutates_nothing() {
        let db = memory_db().await;
        insert(&db, "1", false).await;
        insert(&db, "9", false).await;
        let state = FakeState::with_messages(vec![
            message("1", true, 1),
            message("2", true, 2),
            message("3", true, 3),
        ]);
        state.lock().unwrap().unreachable.insert("2".into());
        let (engine, mut mailbox) = setup(&db, &state, false);

        let err = engine.download(&mut mailbox).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(!stored(&db, "1").await.unwrap().is_read);
        assert!(stored(&db, "9").await.is_some());
        assert!(stored(&db, "3").await.is_none());
    }

    #[tokio::test]
    async fn test_non_voicemail_discarded() {
        let db = memory_db().await;
        let state = FakeState::with_messages(vec![message("1", false, 1), message("2", false, 2)]);
        state.lock().unwrap().not_voicemail.insert("2".into());
        let (engine, mut mailbox) = setup(&db, &state, false);

        let report = engine.download(&mut mailbox).await.unwrap();

        assert_eq!(report.inserted, 1);
        assert!(stored(&db, "2").await.is_none());
    }

    #[tokio::test]
    async fn test_upload_then_download_keeps_local_read() {
        let db = memory_db().await;
        let id = insert(&db, "42", false).await;
        db.voicemails().mark_read_locally(id).await.unwrap();
        let state = FakeState::with_messages(vec![message("42", false, 0)]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        let upload = engine.upload(&mut mailbox).await.unwrap();
        assert!(upload.success);
        assert_eq!(upload.marked_read, 1);
        engine.download(&mut mailbox).await.unwrap();

        assert!(state.lock().unwrap().messages["42"].remote.seen);
        let vm = stored(&db, "42").await.unwrap();
        assert!(vm.is_read);
        assert!(!vm.is_dirty);
    }

    #[tokio::test]
    async fn test_pending_read_not_reverted() {
        let db = memory_db().await;
        let id = insert(&db, "42", false).await;
        db.voicemails().mark_read_locally(id).await.unwrap();
        let state = FakeState::with_messages(vec![message("42", false, 0)]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        engine.download(&mut mailbox).await.unwrap();

        assert!(stored(&db, "42").await.unwrap().is_read);
    }

    #[tokio::test]
    async fn test_failed_delete_batch_keeps_rows() {
        let db = memory_db().await;
        let deleted = insert(&db, "1", false).await;
        let read = insert(&db, "2", false).await;
        db.voicemails().mark_deleted_locally(deleted).await.unwrap();
        db.voicemails().mark_read_locally(read).await.unwrap();
        let state = FakeState::with_messages(vec![message("1", false, 1), message("2", false, 2)]);
        state.lock().unwrap().fail_flags.push(Flag::Deleted);
        let (engine, mut mailbox) = setup(&db, &state, false);

        let report = engine.upload(&mut mailbox).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.marked_read, 1);
        assert!(stored(&db, "1").await.unwrap().is_deleted);
        assert!(!stored(&db, "2").await.unwrap().is_dirty);
    }

    #[tokio::test]
    async fn test_upload_deletes_after_ack() {
        let db = memory_db().await;
        let id = insert(&db, "1", false).await;
        db.voicemails().mark_deleted_locally(id).await.unwrap();
        let state = FakeState::with_messages(vec![message("1", false, 1)]);
        let (engine, mut mailbox) = setup(&db, &state, false);

        let report = engine.upload(&mut mailbox).await.unwrap();

        assert!(report.success);
        assert_eq!(report.deleted, 1);
        assert!(stored(&db, "1").await.is_none());
        assert_eq!(
            state.lock().unwrap().commands,
            vec!["STORE 1 \\Deleted true".to_string()]
        );
    }

    #[tokio::test]
    async fn test_download_one() {
        let db = memory_db().await;
        insert(&db, "8", false).await;
        let mut remote = message("8", false, 0);
        remote.transcription = Some("just text".into());
        let state = FakeState::with_messages(vec![remote]);
        let (engine, mut mailbox) = setup(&db, &state, true);

        assert!(engine.download_one(&mut mailbox, "8").await.unwrap());
        let vm = stored(&db, "8").await.unwrap();
        assert_eq!(vm.transcription.as_deref(), Some("just text"));
        assert!(vm.has_content);

        assert!(!engine.download_one(&mut mailbox, "99").await.unwrap());
    }
}
