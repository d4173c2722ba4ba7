//! Database operations for the conflict_history table.

use crate::error::StoreError;
use listsync_engine::{ConflictRecord, Timestamp};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

/// A stored conflict row from the database.
#[derive(Debug)]
pub struct StoredConflict {
    pub conflict_type: String,
    pub local_data: String,
    pub server_data: String,
    pub timestamp: i64,
    pub resolution: String,
    pub metadata: String,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredConflict {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredConflict {
            conflict_type: row.try_get("conflict_type")?,
            local_data: row.try_get("local_data")?,
            server_data: row.try_get("server_data")?,
            timestamp: row.try_get("timestamp")?,
            resolution: row.try_get("resolution")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl StoredConflict {
    pub fn to_record(&self) -> Result<ConflictRecord, StoreError> {
        Ok(ConflictRecord {
            conflict_type: self.conflict_type.parse()?,
            local_data: serde_json::from_str(&self.local_data)?,
            server_data: serde_json::from_str(&self.server_data)?,
            timestamp: self.timestamp as u64,
            resolution: self.resolution.parse()?,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

/// Append a batch of records in one transaction.
pub async fn insert_conflicts(pool: &SqlitePool, records: &[ConflictRecord]) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO conflict_history (
                conflict_type, local_data, server_data, timestamp, resolution, metadata
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(record.conflict_type.as_str())
        .bind(serde_json::to_string(&record.local_data)?)
        .bind(serde_json::to_string(&record.server_data)?)
        .bind(record.timestamp as i64)
        .bind(record.resolution.as_str())
        .bind(serde_json::to_string(&record.metadata)?)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Get the whole history, oldest first.
pub async fn get_conflicts<'e, E>(executor: E) -> Result<Vec<ConflictRecord>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<StoredConflict> = sqlx::query_as(
        r#"
        SELECT conflict_type, local_data, server_data, timestamp, resolution, metadata
        FROM conflict_history
        ORDER BY timestamp ASC, id ASC
        "#,
    )
    .fetch_all(executor)
    .await?;
    rows.iter().map(StoredConflict::to_record).collect()
}

/// Delete records older than `cutoff`.
pub async fn delete_conflicts_before<'e, E>(executor: E, cutoff: Timestamp) -> Result<u64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM conflict_history WHERE timestamp < ?1")
        .bind(cutoff as i64)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
