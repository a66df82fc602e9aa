//! # Voicemail Repository
//!
//! The local voicemail store the reconciliation engine reads and writes.
//!
//! ## Row Selections
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Selection              WHERE                                           │
//! │  ─────────              ─────                                           │
//! │  read_voicemails        dirty = 1 AND deleted != 1 AND is_read = 1      │
//! │  deleted_voicemails     deleted = 1                                     │
//! │  all_voicemails         (every row of the account)                      │
//! │  oldest_on_server       archived = 0 AND deleted = 0, oldest first      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Host-side edits (`mark_read_locally`, `mark_deleted_locally`) set `dirty`;
//! the upload phase clears it once the server has acknowledged the flag.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use vvm_core::{AccountHandle, Voicemail, VoicemailPayload};

const VOICEMAIL_COLUMNS: &str = "id, account, source_data, timestamp, number, is_read, duration, \
     transcription, dirty, deleted, archived, has_content";

#[derive(Debug, sqlx::FromRow)]
struct VoicemailRow {
    id: i64,
    account: String,
    source_data: String,
    timestamp: DateTime<Utc>,
    number: Option<String>,
    is_read: bool,
    duration: Option<i64>,
    transcription: Option<String>,
    dirty: bool,
    deleted: bool,
    archived: bool,
    has_content: bool,
}

impl From<VoicemailRow> for Voicemail {
    fn from(row: VoicemailRow) -> Self {
        Voicemail {
            id: Some(row.id),
            account: AccountHandle::new(row.account),
            source_data: row.source_data,
            timestamp: row.timestamp,
            number: row.number,
            is_read: row.is_read,
            duration: row.duration,
            transcription: row.transcription,
            is_dirty: row.dirty,
            is_deleted: row.deleted,
            is_archived: row.archived,
            has_content: row.has_content,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PayloadRow {
    mime_type: Option<String>,
    content: Option<Vec<u8>>,
}

/// Repository for voicemail rows.
#[derive(Debug, Clone)]
pub struct VoicemailRepository {
    pool: SqlitePool,
}

impl VoicemailRepository {
    /// Creates a new VoicemailRepository.
    pub fn new(pool: SqlitePool) -> Self {
        VoicemailRepository { pool }
    }

    // =========================================================================
    // Selections
    // =========================================================================

    async fn select_where(
        &self,
        account: &AccountHandle,
        condition: &str,
    ) -> DbResult<Vec<Voicemail>> {
        let sql = format!(
            "SELECT {VOICEMAIL_COLUMNS} FROM voicemails WHERE account = ?1 AND {condition} \
             ORDER BY timestamp ASC, id ASC"
        );

        let rows = sqlx::query_as::<_, VoicemailRow>(&sql)
            .bind(account.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Voicemail::from).collect())
    }

    /// Voicemails read locally whose `\Seen` flag has not been pushed yet.
    pub async fn read_voicemails(&self, account: &AccountHandle) -> DbResult<Vec<Voicemail>> {
        self.select_where(account, "dirty = 1 AND deleted != 1 AND is_read = 1")
            .await
    }

    /// Voicemails deleted locally and still waiting for the server.
    pub async fn deleted_voicemails(&self, account: &AccountHandle) -> DbResult<Vec<Voicemail>> {
        self.select_where(account, "deleted = 1").await
    }

    /// Every voicemail of the account.
    pub async fn all_voicemails(&self, account: &AccountHandle) -> DbResult<Vec<Voicemail>> {
        self.select_where(account, "1 = 1").await
    }

    /// Looks up a voicemail by its server UID.
    pub async fn find_by_source_data(
        &self,
        account: &AccountHandle,
        source_data: &str,
    ) -> DbResult<Option<Voicemail>> {
        let sql = format!(
            "SELECT {VOICEMAIL_COLUMNS} FROM voicemails WHERE account = ?1 AND source_data = ?2"
        );

        let row = sqlx::query_as::<_, VoicemailRow>(&sql)
            .bind(account.as_str())
            .bind(source_data)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Voicemail::from))
    }

    /// Oldest voicemails still stored on the server, up to `limit`.
    pub async fn oldest_on_server(
        &self,
        account: &AccountHandle,
        limit: i64,
    ) -> DbResult<Vec<Voicemail>> {
        let sql = format!(
            "SELECT {VOICEMAIL_COLUMNS} FROM voicemails \
             WHERE account = ?1 AND archived = 0 AND deleted = 0 \
             ORDER BY timestamp ASC, id ASC LIMIT ?2"
        );

        let rows = sqlx::query_as::<_, VoicemailRow>(&sql)
            .bind(account.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Voicemail::from).collect())
    }

    /// Number of voicemails stored for the account.
    pub async fn count(&self, account: &AccountHandle) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM voicemails WHERE account = ?1")
            .bind(account.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Inserts a voicemail first seen on the server and returns its row id.
    pub async fn insert(&self, voicemail: &Voicemail) -> DbResult<i64> {
        debug!(
            account = %voicemail.account,
            source_data = %voicemail.source_data,
            "Inserting voicemail"
        );

        let result = sqlx::query(
            r#"
            INSERT INTO voicemails (
                account, source_data, timestamp, number, is_read, duration,
                transcription, dirty, deleted, archived, has_content
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(voicemail.account.as_str())
        .bind(&voicemail.source_data)
        .bind(voicemail.timestamp)
        .bind(&voicemail.number)
        .bind(voicemail.is_read)
        .bind(voicemail.duration)
        .bind(&voicemail.transcription)
        .bind(voicemail.is_dirty)
        .bind(voicemail.is_deleted)
        .bind(voicemail.is_archived)
        .bind(voicemail.has_content)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Deletes rows by id. Returns the number of rows removed.
    pub async fn delete(&self, ids: &[i64]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM voicemails WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Deletes a row unless it is archived. Returns true if a row was removed.
    pub async fn delete_non_archived(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM voicemails WHERE id = ?1 AND archived = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Clears the dirty flag of the given rows.
    pub async fn mark_clean(&self, ids: &[i64]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE voicemails SET dirty = 0 WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Sets the read state as observed on the server. Does not touch `dirty`.
    pub async fn set_read(&self, id: i64, is_read: bool) -> DbResult<()> {
        sqlx::query("UPDATE voicemails SET is_read = ?2 WHERE id = ?1")
            .bind(id)
            .bind(is_read)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Host-side "mark as read": pending upload until acknowledged.
    pub async fn mark_read_locally(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query("UPDATE voicemails SET is_read = 1, dirty = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Voicemail", id.to_string()));
        }
        Ok(())
    }

    /// Host-side "delete": the row stays until the server has the `\Deleted` flag.
    pub async fn mark_deleted_locally(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query("UPDATE voicemails SET deleted = 1, dirty = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Voicemail", id.to_string()));
        }
        Ok(())
    }

    /// Stores a transcription.
    pub async fn update_transcription(&self, id: i64, transcription: &str) -> DbResult<()> {
        sqlx::query("UPDATE voicemails SET transcription = ?2 WHERE id = ?1")
            .bind(id)
            .bind(transcription)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Flags rows as archived: removed from the server, kept locally.
    pub async fn mark_archived(&self, ids: &[i64]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder =
            QueryBuilder::<Sqlite>::new("UPDATE voicemails SET archived = 1 WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Payload
    // =========================================================================

    /// Caches the decoded audio of a voicemail and sets `has_content`.
    pub async fn save_payload(&self, id: i64, payload: &VoicemailPayload) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE voicemails SET mime_type = ?2, content = ?3, has_content = 1 WHERE id = ?1",
        )
        .bind(id)
        .bind(&payload.mime_type)
        .bind(&payload.data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Voicemail", id.to_string()));
        }

        debug!(id, bytes = payload.data.len(), "Payload cached");
        Ok(())
    }

    /// Returns the cached audio, if any.
    pub async fn payload(&self, id: i64) -> DbResult<Option<VoicemailPayload>> {
        let row = sqlx::query_as::<_, PayloadRow>(
            "SELECT mime_type, content FROM voicemails WHERE id = ?1 AND has_content = 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| match (row.mime_type, row.content) {
            (Some(mime_type), Some(data)) => Some(VoicemailPayload { mime_type, data }),
            _ => None,
        }))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use chrono::{Duration, Utc};
    use vvm_core::{AccountHandle, Voicemail, VoicemailPayload};

    async fn setup() -> (Database, AccountHandle) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        (db, AccountHandle::new("sim-1"))
    }

    fn voicemail(account: &AccountHandle, uid: &str, minutes_ago: i64) -> Voicemail {
        Voicemail::for_insertion(
            account.clone(),
            uid,
            Utc::now() - Duration::minutes(minutes_ago),
            Some("5551234".to_string()),
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let (db, account) = setup().await;
        let repo = db.voicemails();

        let id = repo
            .insert(&voicemail(&account, "42", 5).with_duration(Some(17)))
            .await
            .unwrap();

        let found = repo.find_by_source_data(&account, "42").await.unwrap().unwrap();
        assert_eq!(found.id, Some(id));
        assert_eq!(found.duration, Some(17));
        assert_eq!(found.number.as_deref(), Some("5551234"));
        assert!(!found.is_read);

        let other = AccountHandle::new("sim-2");
        assert!(repo.find_by_source_data(&other, "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_source_data_rejected() {
        let (db, account) = setup().await;
        let repo = db.voicemails();

        repo.insert(&voicemail(&account, "1", 1)).await.unwrap();
        let err = repo.insert(&voicemail(&account, "1", 1)).await.unwrap_err();
        assert!(matches!(err, crate::DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_pending_selections() {
        let (db, account) = setup().await;
        let repo = db.voicemails();

        let read = repo.insert(&voicemail(&account, "1", 3)).await.unwrap();
        let deleted = repo.insert(&voicemail(&account, "2", 2)).await.unwrap();
        let untouched = repo.insert(&voicemail(&account, "3", 1)).await.unwrap();

        repo.mark_read_locally(read).await.unwrap();
        repo.mark_read_locally(deleted).await.unwrap();
        repo.mark_deleted_locally(deleted).await.unwrap();

        let pending_read = repo.read_voicemails(&account).await.unwrap();
        assert_eq!(pending_read.len(), 1);
        assert_eq!(pending_read[0].id, Some(read));

        let pending_delete = repo.deleted_voicemails(&account).await.unwrap();
        assert_eq!(pending_delete.len(), 1);
        assert_eq!(pending_delete[0].id, Some(deleted));

        repo.mark_clean(&[read]).await.unwrap();
        assert!(repo.read_voicemails(&account).await.unwrap().is_empty());

        assert_eq!(repo.delete(&[deleted]).await.unwrap(), 1);
        let remaining: Vec<_> = repo
            .all_voicemails(&account)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|vm| vm.id)
            .collect();
        assert_eq!(remaining, vec![read, untouched]);
    }

    #[tokio::test]
    async fn test_archived_rows_survive_remote_removal() {
        let (db, account) = setup().await;
        let repo = db.voicemails();

        let old = repo.insert(&voicemail(&account, "1", 10)).await.unwrap();
        let new = repo.insert(&voicemail(&account, "2", 1)).await.unwrap();

        let oldest = repo.oldest_on_server(&account, 1).await.unwrap();
        assert_eq!(oldest[0].id, Some(old));

        repo.mark_archived(&[old]).await.unwrap();
        assert!(!repo.delete_non_archived(old).await.unwrap());
        assert!(repo.delete_non_archived(new).await.unwrap());
        assert_eq!(repo.count(&account).await.unwrap(), 1);

        assert!(repo.oldest_on_server(&account, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payload_roundtrip_sets_has_content() {
        let (db, account) = setup().await;
        let repo = db.voicemails();

        let id = repo.insert(&voicemail(&account, "9", 1)).await.unwrap();
        assert!(repo.payload(id).await.unwrap().is_none());

        let payload = VoicemailPayload {
            mime_type: "audio/amr".to_string(),
            data: vec![0x23, 0x21, 0x41, 0x4d, 0x52],
        };
        repo.save_payload(id, &payload).await.unwrap();

        assert_eq!(repo.payload(id).await.unwrap(), Some(payload));
        let stored = repo.find_by_source_data(&account, "9").await.unwrap().unwrap();
        assert!(stored.has_content);
    }

    #[tokio::test]
    async fn test_local_edit_of_missing_row_is_not_found() {
        let (db, _) = setup().await;
        let err = db.voicemails().mark_read_locally(999).await.unwrap_err();
        assert!(matches!(err, crate::DbError::NotFound { .. }));
    }
}
