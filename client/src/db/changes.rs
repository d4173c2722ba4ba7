//! Database operations for the pending_changes table.

use crate::error::StoreError;
use listsync_engine::{ChangeId, NewChange, PendingChange};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

/// A stored pending-change row from the database.
#[derive(Debug)]
pub struct StoredChange {
    pub id: i64,
    pub action_type: String,
    pub entity_id: String,
    pub payload: String,
    pub timestamp: i64,
    pub retries: i64,
    pub status: String,
    pub base_version: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredChange {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredChange {
            id: row.try_get("id")?,
            action_type: row.try_get("action_type")?,
            entity_id: row.try_get("entity_id")?,
            payload: row.try_get("payload")?,
            timestamp: row.try_get("timestamp")?,
            retries: row.try_get("retries")?,
            status: row.try_get("status")?,
            base_version: row.try_get("base_version")?,
        })
    }
}

impl StoredChange {
    /// Convert database row to a pending change.
    pub fn to_change(&self) -> Result<PendingChange, StoreError> {
        Ok(PendingChange {
            id: self.id as ChangeId,
            action_type: self.action_type.parse()?,
            entity_id: self.entity_id.clone(),
            payload: serde_json::from_str(&self.payload)?,
            timestamp: self.timestamp as u64,
            retries: self.retries as u32,
            status: self.status.parse()?,
            base_version: self.base_version as u64,
        })
    }
}

const SELECT_CHANGES: &str = r#"
    SELECT id, action_type, entity_id, payload, timestamp, retries, status, base_version
    FROM pending_changes
"#;

/// Append a change. Returns it with its assigned sequence number.
pub async fn insert_change<'e, E>(executor: E, change: NewChange) -> Result<PendingChange, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(&change.payload)?;
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO pending_changes (
            action_type, entity_id, payload, timestamp, retries, status, base_version
        )
        VALUES (?1, ?2, ?3, ?4, 0, 'pending', ?5)
        RETURNING id
        "#,
    )
    .bind(change.action_type.as_str())
    .bind(&change.entity_id)
    .bind(payload)
    .bind(change.timestamp as i64)
    .bind(change.base_version as i64)
    .fetch_one(executor)
    .await?;

    Ok(change.into_pending(id as ChangeId))
}

/// Overwrite the mutable columns of a change.
pub async fn update_change<'e, E>(executor: E, change: &PendingChange) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(&change.payload)?;
    sqlx::query(
        r#"
        UPDATE pending_changes
        SET entity_id = ?2, payload = ?3, retries = ?4, status = ?5, base_version = ?6
        WHERE id = ?1
        "#,
    )
    .bind(change.id as i64)
    .bind(&change.entity_id)
    .bind(payload)
    .bind(change.retries as i64)
    .bind(change.status.as_str())
    .bind(change.base_version as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// Remove a change.
pub async fn delete_change<'e, E>(executor: E, id: ChangeId) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM pending_changes WHERE id = ?1")
        .bind(id as i64)
        .execute(executor)
        .await?;
    Ok(())
}

/// Get every change, ordered by (timestamp, id).
pub async fn get_all_changes<'e, E>(executor: E) -> Result<Vec<PendingChange>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!("{SELECT_CHANGES} ORDER BY timestamp ASC, id ASC");
    let rows: Vec<StoredChange> = sqlx::query_as(&query).fetch_all(executor).await?;
    rows.iter().map(StoredChange::to_change).collect()
}

/// Get one change.
pub async fn get_change<'e, E>(executor: E, id: ChangeId) -> Result<Option<PendingChange>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!("{SELECT_CHANGES} WHERE id = ?1");
    let row: Option<StoredChange> = sqlx::query_as(&query)
        .bind(id as i64)
        .fetch_optional(executor)
        .await?;
    row.map(|row| row.to_change()).transpose()
}
