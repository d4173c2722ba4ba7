//! Database operations for the id_mappings table.

use crate::error::StoreError;
use listsync_engine::{IdMapping, MappingStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

/// A stored id mapping row from the database.
#[derive(Debug)]
pub struct StoredMapping {
    pub temp_id: String,
    pub actual_id: String,
    pub status: String,
    pub created_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredMapping {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredMapping {
            temp_id: row.try_get("temp_id")?,
            actual_id: row.try_get("actual_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StoredMapping {
    pub fn to_mapping(&self) -> Result<IdMapping, StoreError> {
        Ok(IdMapping::new(
            &self.temp_id,
            &self.actual_id,
            self.status.parse()?,
            self.created_at as u64,
        ))
    }
}

/// Insert or replace a mapping, keyed by temp id.
pub async fn upsert_mapping<'e, E>(executor: E, mapping: &IdMapping) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO id_mappings (temp_id, actual_id, status, created_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (temp_id) DO UPDATE SET
            actual_id = excluded.actual_id,
            status = excluded.status,
            created_at = excluded.created_at
        "#,
    )
    .bind(&mapping.temp_id)
    .bind(&mapping.actual_id)
    .bind(mapping.status.as_str())
    .bind(mapping.created_at as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// Find a mapping by temp id or actual id.
pub async fn find_mapping<'e, E>(executor: E, id: &str) -> Result<Option<IdMapping>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<StoredMapping> = sqlx::query_as(
        r#"
        SELECT temp_id, actual_id, status, created_at
        FROM id_mappings
        WHERE temp_id = ?1 OR actual_id = ?1
        ORDER BY temp_id = ?1 DESC
        LIMIT 1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    row.map(|row| row.to_mapping()).transpose()
}

pub async fn get_all_mappings<'e, E>(executor: E) -> Result<Vec<IdMapping>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<StoredMapping> = sqlx::query_as(
        "SELECT temp_id, actual_id, status, created_at FROM id_mappings ORDER BY created_at, temp_id",
    )
    .fetch_all(executor)
    .await?;
    rows.iter().map(StoredMapping::to_mapping).collect()
}

pub async fn update_mapping_status<'e, E>(
    executor: E,
    temp_id: &str,
    status: MappingStatus,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE id_mappings SET status = ?2 WHERE temp_id = ?1")
        .bind(temp_id)
        .bind(status.as_str())
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn delete_mapping<'e, E>(executor: E, temp_id: &str) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM id_mappings WHERE temp_id = ?1")
        .bind(temp_id)
        .execute(executor)
        .await?;
    Ok(())
}
