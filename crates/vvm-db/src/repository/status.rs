//! # Status Repository
//!
//! One row per account, overwritten on every sync attempt and never deleted.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;
use vvm_core::{AccountHandle, ConfigurationState, DataChannelState, VoicemailStatus};

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    account: String,
    configuration_state: ConfigurationState,
    data_channel_state: DataChannelState,
    last_event: Option<String>,
    quota_occupied: Option<i64>,
    quota_total: Option<i64>,
    updated_at: DateTime<Utc>,
}

impl From<StatusRow> for VoicemailStatus {
    fn from(row: StatusRow) -> Self {
        VoicemailStatus {
            account: AccountHandle::new(row.account),
            configuration_state: row.configuration_state,
            data_channel_state: row.data_channel_state,
            last_event: row.last_event,
            quota_occupied: row.quota_occupied,
            quota_total: row.quota_total,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for per-account status.
#[derive(Debug, Clone)]
pub struct StatusRepository {
    pool: SqlitePool,
}

impl StatusRepository {
    /// Creates a new StatusRepository.
    pub fn new(pool: SqlitePool) -> Self {
        StatusRepository { pool }
    }

    /// Returns the stored status of an account.
    pub async fn get(&self, account: &AccountHandle) -> DbResult<Option<VoicemailStatus>> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT account, configuration_state, data_channel_state, last_event,
                   quota_occupied, quota_total, updated_at
            FROM voicemail_status
            WHERE account = ?1
            "#,
        )
        .bind(account.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(VoicemailStatus::from))
    }

    /// Returns the status of every account, ordered by account id.
    pub async fn list(&self) -> DbResult<Vec<VoicemailStatus>> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT account, configuration_state, data_channel_state, last_event,
                   quota_occupied, quota_total, updated_at
            FROM voicemail_status
            ORDER BY account ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(VoicemailStatus::from).collect())
    }

    /// Inserts or overwrites the status of an account.
    pub async fn save(&self, status: &VoicemailStatus) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO voicemail_status (
                account, configuration_state, data_channel_state, last_event,
                quota_occupied, quota_total, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(account) DO UPDATE SET
                configuration_state = excluded.configuration_state,
                data_channel_state = excluded.data_channel_state,
                last_event = excluded.last_event,
                quota_occupied = excluded.quota_occupied,
                quota_total = excluded.quota_total,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(status.account.as_str())
        .bind(status.configuration_state)
        .bind(status.data_channel_state)
        .bind(&status.last_event)
        .bind(status.quota_occupied)
        .bind(status.quota_total)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use vvm_core::{AccountHandle, ConfigurationState, DataChannelState, Quota, VoicemailStatus, VvmEvent};

    #[tokio::test]
    async fn test_status_upsert() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.status();
        let account = AccountHandle::new("sim-1");

        assert!(repo.get(&account).await.unwrap().is_none());

        let mut status = VoicemailStatus::new(account.clone());
        status.apply_event(VvmEvent::DataAuthInvalidPassword);
        repo.save(&status).await.unwrap();

        status.apply_event(VvmEvent::DataImapOperationCompleted);
        status.set_quota(Quota::new(12, 40));
        repo.save(&status).await.unwrap();

        let stored = repo.get(&account).await.unwrap().unwrap();
        assert_eq!(stored.configuration_state, ConfigurationState::Ok);
        assert_eq!(stored.data_channel_state, DataChannelState::Ok);
        assert_eq!(stored.last_event.as_deref(), Some("data_imap_operation_completed"));
        assert_eq!(stored.quota(), Some(Quota::new(12, 40)));
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
