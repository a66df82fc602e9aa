//! # Credentials Repository
//!
//! IMAP credentials as delivered by the carrier (`u`, `pw`, `srv`, `ipt`).
//! The port column is text; it is parsed at connect time.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;
use vvm_core::{AccountHandle, ImapCredentials};

#[derive(sqlx::FromRow)]
struct CredentialsRow {
    username: String,
    password: String,
    server: String,
    port: String,
}

/// Repository for account credentials.
#[derive(Debug, Clone)]
pub struct CredentialsRepository {
    pool: SqlitePool,
}

impl CredentialsRepository {
    /// Creates a new CredentialsRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CredentialsRepository { pool }
    }

    /// Returns the stored credentials of an account.
    pub async fn get(&self, account: &AccountHandle) -> DbResult<Option<ImapCredentials>> {
        let row = sqlx::query_as::<_, CredentialsRow>(
            "SELECT username, password, server, port FROM account_credentials WHERE account = ?1",
        )
        .bind(account.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ImapCredentials {
            username: row.username,
            password: row.password,
            server: row.server,
            port: row.port,
        }))
    }

    /// Stores (or replaces) the credentials of an account.
    pub async fn save(&self, account: &AccountHandle, credentials: &ImapCredentials) -> DbResult<()> {
        info!(account = %account, server = %credentials.server, "Storing IMAP credentials");

        sqlx::query(
            r#"
            INSERT INTO account_credentials (account, username, password, server, port)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account) DO UPDATE SET
                username = excluded.username,
                password = excluded.password,
                server = excluded.server,
                port = excluded.port
            "#,
        )
        .bind(account.as_str())
        .bind(&credentials.username)
        .bind(&credentials.password)
        .bind(&credentials.server)
        .bind(&credentials.port)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes the credentials of an account. Returns true if a row existed.
    pub async fn delete(&self, account: &AccountHandle) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM account_credentials WHERE account = ?1")
            .bind(account.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use vvm_core::{AccountHandle, ImapCredentials};

    #[tokio::test]
    async fn test_credentials_roundtrip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.credentials();
        let account = AccountHandle::new("sim-1");

        let creds = ImapCredentials {
            username: "5551234@vvm.example".into(),
            password: "secret".into(),
            server: "vvm.example".into(),
            port: "143".into(),
        };
        repo.save(&account, &creds).await.unwrap();
        assert_eq!(repo.get(&account).await.unwrap(), Some(creds));

        assert!(repo.delete(&account).await.unwrap());
        assert!(repo.get(&account).await.unwrap().is_none());
    }
}
