//! Registration imports

use hope_common::db::ImportStatus;
use hope_common::Result;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{now_text, opt_text, parse_opt_uuid, parse_time, parse_uuid};

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationImport {
    pub id: Uuid,
    pub business_area_id: Uuid,
    /// Program the import registers into, None for business-area level
    pub program_id: Option<Uuid>,
    pub name: String,
    pub status: ImportStatus,
    pub error_message: Option<String>,
    pub merged_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn insert_import(conn: &mut SqliteConnection, import: &RegistrationImport) -> Result<()> {
    sqlx::query(
        "INSERT INTO registration_imports (id, business_area_id, program_id, name, status, \
         error_message, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(import.id.to_string())
    .bind(import.business_area_id.to_string())
    .bind(opt_text(import.program_id))
    .bind(&import.name)
    .bind(import.status.as_str())
    .bind(&import.error_message)
    .bind(now_text())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn load_import(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<RegistrationImport>> {
    let row = sqlx::query(
        "SELECT id, business_area_id, program_id, name, status, error_message, merged_at FROM \
         registration_imports WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let id: String = row.get("id");
            let ba: String = row.get("business_area_id");
            let status: String = row.get("status");
            let merged_at: Option<String> = row.get("merged_at");
            Ok(Some(RegistrationImport {
                id: parse_uuid(&id)?,
                business_area_id: parse_uuid(&ba)?,
                program_id: parse_opt_uuid(row.get("program_id"))?,
                name: row.get("name"),
                status: status.parse()?,
                error_message: row.get("error_message"),
                merged_at: merged_at.as_deref().map(parse_time).transpose()?,
            }))
        }
        None => Ok(None),
    }
}

/// Move to `status`, only from one of `from`. Returns false when the import
/// was in another state.
pub async fn transition(
    conn: &mut SqliteConnection,
    id: Uuid,
    from: &[ImportStatus],
    status: ImportStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let mut builder =
        sqlx::QueryBuilder::<sqlx::Sqlite>::new("UPDATE registration_imports SET status = ");
    builder.push_bind(status.as_str());
    builder.push(", error_message = ");
    builder.push_bind(error_message.map(str::to_string));
    if status == ImportStatus::Merged {
        builder.push(", merged_at = ");
        builder.push_bind(now_text());
    }
    builder.push(" WHERE id = ");
    builder.push_bind(id.to_string());
    builder.push(" AND status IN (");
    let mut separated = builder.separated(", ");
    for state in from {
        separated.push_bind(state.as_str());
    }
    separated.push_unseparated(")");

    let result = builder.build().execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}
