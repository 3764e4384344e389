//! Unit-of-work journal
//!
//! The journal insert is the first write of every batch transaction, so the
//! batch holds the store's write lock from its first statement on.

use hope_common::Result;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{now_text, parse_uuid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: Uuid,
    pub operation: String,
    pub batch_index: i64,
    pub item_count: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub finished: bool,
}

pub async fn open_batch(
    conn: &mut SqliteConnection,
    operation: &str,
    batch_index: usize,
    item_count: usize,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO batch_journal (id, operation, batch_index, item_count, started_at) VALUES (?, \
         ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(operation)
    .bind(batch_index as i64)
    .bind(item_count as i64)
    .bind(now_text())
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn finish_batch(
    conn: &mut SqliteConnection,
    id: Uuid,
    succeeded: usize,
    failed: usize,
) -> Result<()> {
    sqlx::query("UPDATE batch_journal SET succeeded = ?, failed = ?, finished_at = ? WHERE id = ?")
        .bind(succeeded as i64)
        .bind(failed as i64)
        .bind(now_text())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Committed batches of an operation, in order
pub async fn entries(conn: &mut SqliteConnection, operation: &str) -> Result<Vec<JournalEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, operation, batch_index, item_count, succeeded, failed, finished_at
        FROM batch_journal WHERE operation = ? ORDER BY started_at, batch_index
        "#,
    )
    .bind(operation)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let finished_at: Option<String> = row.get("finished_at");
            Ok(JournalEntry {
                id: parse_uuid(&id)?,
                operation: row.get("operation"),
                batch_index: row.get("batch_index"),
                item_count: row.get("item_count"),
                succeeded: row.get("succeeded"),
                failed: row.get("failed"),
                finished: finished_at.is_some(),
            })
        })
        .collect()
}
