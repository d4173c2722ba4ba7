//! Database operations for the lists table.

use crate::error::StoreError;
use listsync_engine::List;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

/// A stored list row from the database.
#[derive(Debug)]
pub struct StoredList {
    pub id: String,
    pub payload: String,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredList {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredList {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl StoredList {
    /// Convert database row to a list.
    pub fn to_list(&self) -> Result<List, StoreError> {
        let list: List = serde_json::from_str(&self.payload)?;
        if list.id != self.id {
            return Err(StoreError::Corrupt(format!(
                "list row {} holds payload for {}",
                self.id, list.id
            )));
        }
        Ok(list)
    }
}

/// Upsert a list (insert or replace).
pub async fn upsert_list<'e, E>(executor: E, list: &List) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(list)?;
    sqlx::query(
        r#"
        INSERT INTO lists (id, payload, version, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (id) DO UPDATE SET
            payload = excluded.payload,
            version = excluded.version,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&list.id)
    .bind(payload)
    .bind(list.version as i64)
    .bind(list.updated_at as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// Delete a list by id.
pub async fn delete_list<'e, E>(executor: E, id: &str) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM lists WHERE id = ?1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Get a list by id.
pub async fn get_list<'e, E>(executor: E, id: &str) -> Result<Option<List>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<StoredList> = sqlx::query_as("SELECT id, payload FROM lists WHERE id = ?1")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.map(|row| row.to_list()).transpose()
}

/// Get every list, ordered by id.
pub async fn get_all_lists<'e, E>(executor: E) -> Result<Vec<List>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<StoredList> = sqlx::query_as("SELECT id, payload FROM lists ORDER BY id")
        .fetch_all(executor)
        .await?;
    rows.iter().map(StoredList::to_list).collect()
}
