//! Repositories over sqlx/SQLite.

use bc_common::DeliveryStatus;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::entity::{Broadcast, Recipient};
use crate::{Result, StoreError};

#[derive(Clone)]
pub struct BroadcastRepository {
    pool: Pool<Sqlite>,
}

impl BroadcastRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broadcasts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                message_content TEXT,
                template_name TEXT,
                language_code TEXT NOT NULL,
                business_account_id TEXT NOT NULL,
                sender_phone_id TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Broadcast schema initialized");
        Ok(())
    }

    pub async fn insert(&self, broadcast: &Broadcast) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broadcasts
                (id, user_id, message_content, template_name, language_code,
                 business_account_id, sender_phone_id, completed, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&broadcast.id)
        .bind(&broadcast.user_id)
        .bind(&broadcast.message_content)
        .bind(&broadcast.template_name)
        .bind(&broadcast.language_code)
        .bind(&broadcast.business_account_id)
        .bind(&broadcast.sender_phone_id)
        .bind(broadcast.completed as i64)
        .bind(broadcast.created_at)
        .bind(broadcast.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Broadcast>> {
        let row = sqlx::query("SELECT * FROM broadcasts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(broadcast_from_row).transpose()
    }

    pub async fn mark_completed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE broadcasts SET completed = 1, updated_at = ? WHERE id = ? AND completed = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Submit rollback path: remove a partially created broadcast.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM broadcasts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RecipientRepository {
    pool: Pool<Sqlite>,
}

impl RecipientRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                broadcast_id TEXT NOT NULL,
                phone_number TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                provider_message_id TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_recipients_broadcast
            ON recipients (broadcast_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Recipient schema initialized");
        Ok(())
    }

    pub async fn insert_many(&self, recipients: &[Recipient]) -> Result<()> {
        for recipient in recipients {
            sqlx::query(
                r#"
                INSERT INTO recipients
                    (id, broadcast_id, phone_number, status, attempt_count,
                     last_error, provider_message_id, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&recipient.id)
            .bind(&recipient.broadcast_id)
            .bind(&recipient.phone_number)
            .bind(recipient.status.as_str())
            .bind(recipient.attempt_count as i64)
            .bind(&recipient.last_error)
            .bind(&recipient.provider_message_id)
            .bind(recipient.updated_at)
            .execute(&self.pool)
            .await?;
        }
        debug!(count = recipients.len(), "Recipients inserted");
        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Recipient>> {
        let row = sqlx::query("SELECT * FROM recipients WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(recipient_from_row).transpose()
    }

    pub async fn find_by_broadcast(&self, broadcast_id: &str) -> Result<Vec<Recipient>> {
        let rows = sqlx::query("SELECT * FROM recipients WHERE broadcast_id = ?")
            .bind(broadcast_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(recipient_from_row).collect()
    }

    /// Record the outcome of one attempt on one recipient.
    ///
    /// Fails with `NotFound` if the row is gone - callers must see persistence
    /// problems, not have them swallowed.
    pub async fn update_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        attempt_count: u32,
        last_error: Option<&str>,
        provider_message_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE recipients
            SET status = ?, attempt_count = ?, last_error = ?,
                provider_message_id = COALESCE(?, provider_message_id),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(attempt_count as i64)
        .bind(last_error)
        .bind(provider_message_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("Recipient", id));
        }
        Ok(())
    }

    /// Snapshot of recipient counts per status for one broadcast.
    ///
    /// A single GROUP BY statement, so each recipient lands in exactly one
    /// bucket per read.
    pub async fn count_by_status(
        &self,
        broadcast_id: &str,
    ) -> Result<BTreeMap<DeliveryStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as count FROM recipients WHERE broadcast_id = ? GROUP BY status",
        )
        .bind(broadcast_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status_str: String = row.get("status");
            let count: i64 = row.get("count");
            let status = DeliveryStatus::parse(&status_str)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status_str}")))?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    /// Recipients of a broadcast that have not reached a terminal status.
    pub async fn count_non_terminal(&self, broadcast_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM recipients WHERE broadcast_id = ? AND status NOT IN ('SENT', 'FAILED')",
        )
        .bind(broadcast_id)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.get("count");
        Ok(count as u64)
    }

    /// Submit rollback path: remove all recipients of a broadcast.
    pub async fn delete_by_broadcast(&self, broadcast_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM recipients WHERE broadcast_id = ?")
            .bind(broadcast_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn broadcast_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Broadcast> {
    let completed: i64 = row.get("completed");
    Ok(Broadcast {
        id: row.get("id"),
        user_id: row.get("user_id"),
        message_content: row.get("message_content"),
        template_name: row.get("template_name"),
        language_code: row.get("language_code"),
        business_account_id: row.get("business_account_id"),
        sender_phone_id: row.get("sender_phone_id"),
        completed: completed != 0,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

fn recipient_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Recipient> {
    let status_str: String = row.get("status");
    let status = DeliveryStatus::parse(&status_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status_str}")))?;
    let attempt_count: i64 = row.get("attempt_count");
    Ok(Recipient {
        id: row.get("id"),
        broadcast_id: row.get("broadcast_id"),
        phone_number: row.get("phone_number"),
        status,
        attempt_count: attempt_count as u32,
        last_error: row.get("last_error"),
        provider_message_id: row.get("provider_message_id"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}
