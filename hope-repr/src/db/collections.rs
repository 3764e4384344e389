//! Collection rows and lineage lookups shared by households and individuals

use hope_common::db::EntityKind;
use hope_common::{Error, Result};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{now_text, parse_opt_uuid, parse_uuid};

/// One member of a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMember {
    pub id: Uuid,
    pub program_id: Option<Uuid>,
}

pub async fn insert_collection(conn: &mut SqliteConnection, kind: EntityKind) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO collections (id, kind, created_at) VALUES (?, ?, ?)")
        .bind(id.to_string())
        .bind(kind.as_str())
        .bind(now_text())
        .execute(&mut *conn)
        .await?;
    Ok(id)
}

pub async fn delete_collection(conn: &mut SqliteConnection, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM collections WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Current `collection_id` of an entity row.
///
/// `Err(NotFound)` when the row does not exist, `Ok(None)` when it was
/// never copied.
pub async fn collection_of(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: Uuid,
) -> Result<Option<Uuid>> {
    let sql = format!("SELECT collection_id FROM {} WHERE id = ?", kind.table());
    let row: Option<Option<String>> = sqlx::query_scalar(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(collection) => parse_opt_uuid(collection),
        None => Err(Error::NotFound(format!("{} {}", kind, id))),
    }
}

/// Attach `collection_id` unless the row already has one.
/// Returns false when another writer got there first.
pub async fn attach_if_unset(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: Uuid,
    collection_id: Uuid,
) -> Result<bool> {
    let sql = format!(
        "UPDATE {} SET collection_id = ?, updated_at = ? WHERE id = ? AND collection_id IS NULL",
        kind.table()
    );
    let result = sqlx::query(&sql)
        .bind(collection_id.to_string())
        .bind(now_text())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Representation of a lineage in a program, if any
pub async fn find_in_program(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    collection_id: Uuid,
    program_id: Uuid,
) -> Result<Option<Uuid>> {
    let sql = format!(
        "SELECT id FROM {} WHERE collection_id = ? AND program_id = ? AND rdi_merge_status <> \
         'REMOVED'",
        kind.table()
    );
    let id: Option<String> = sqlx::query_scalar(&sql)
        .bind(collection_id.to_string())
        .bind(program_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    id.as_deref().map(parse_uuid).transpose()
}

/// Whether any other row names `id` as its origin
pub async fn has_outgoing_copies(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: Uuid,
) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE copied_from_id = ? AND id <> ?)",
        kind.table()
    );
    let exists: i64 = sqlx::query_scalar(&sql)
        .bind(id.to_string())
        .bind(id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    Ok(exists != 0)
}

/// Every representation of a lineage, any program, oldest first
pub async fn collection_members(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    collection_id: Uuid,
) -> Result<Vec<CollectionMember>> {
    let sql = format!(
        "SELECT id, program_id FROM {} WHERE collection_id = ? AND rdi_merge_status <> 'REMOVED' \
         ORDER BY created_at, id",
        kind.table()
    );
    let rows = sqlx::query(&sql)
        .bind(collection_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            Ok(CollectionMember {
                id: parse_uuid(&id)?,
                program_id: parse_opt_uuid(row.get("program_id"))?,
            })
        })
        .collect()
}
