//! Business-area configuration: business areas, programs, document types
//!
//! Read-only for the engine; the insert helpers exist for provisioning and
//! fixtures.

use hope_common::Result;
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;
use uuid::Uuid;

use super::parse_uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessArea {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    /// Deduplication is deferred for every program of this area
    pub postpone_deduplication: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub id: Uuid,
    pub business_area_id: Uuid,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentType {
    pub key: String,
    pub label: String,
    pub valid_for_deduplication: bool,
}

pub async fn load_business_area(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Option<BusinessArea>> {
    let row = sqlx::query(
        "SELECT id, slug, name, postpone_deduplication FROM business_areas WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let id: String = row.get("id");
            Ok(Some(BusinessArea {
                id: parse_uuid(&id)?,
                slug: row.get("slug"),
                name: row.get("name"),
                postpone_deduplication: row.get::<i64, _>("postpone_deduplication") != 0,
            }))
        }
        None => Ok(None),
    }
}

pub async fn load_program(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Program>> {
    let row = sqlx::query("SELECT id, business_area_id, name, status FROM programs WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let id: String = row.get("id");
            let ba: String = row.get("business_area_id");
            Ok(Some(Program {
                id: parse_uuid(&id)?,
                business_area_id: parse_uuid(&ba)?,
                name: row.get("name"),
                status: row.get("status"),
            }))
        }
        None => Ok(None),
    }
}

/// Keys of document types that take part in deduplication
pub async fn dedup_document_types(conn: &mut SqliteConnection) -> Result<HashSet<String>> {
    let keys: Vec<String> =
        sqlx::query_scalar("SELECT key FROM document_types WHERE valid_for_deduplication = 1")
            .fetch_all(&mut *conn)
            .await?;
    Ok(keys.into_iter().collect())
}

pub async fn insert_business_area(conn: &mut SqliteConnection, area: &BusinessArea) -> Result<()> {
    sqlx::query(
        "INSERT INTO business_areas (id, slug, name, postpone_deduplication) VALUES (?, ?, ?, ?)",
    )
    .bind(area.id.to_string())
    .bind(&area.slug)
    .bind(&area.name)
    .bind(area.postpone_deduplication)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_program(conn: &mut SqliteConnection, program: &Program) -> Result<()> {
    sqlx::query("INSERT INTO programs (id, business_area_id, name, status) VALUES (?, ?, ?, ?)")
        .bind(program.id.to_string())
        .bind(program.business_area_id.to_string())
        .bind(&program.name)
        .bind(&program.status)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn upsert_document_type(
    conn: &mut SqliteConnection,
    doc_type: &DocumentType,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document_types (key, label, valid_for_deduplication) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            label = excluded.label,
            valid_for_deduplication = excluded.valid_for_deduplication
        "#,
    )
    .bind(&doc_type.key)
    .bind(&doc_type.label)
    .bind(doc_type.valid_for_deduplication)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hope_common::db::open_in_memory;

    #[tokio::test]
    async fn test_configuration_round_trip() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "afghanistan".into(),
            name: "Afghanistan".into(),
            postpone_deduplication: true,
        };
        insert_business_area(&mut conn, &area).await.unwrap();
        let program = Program {
            id: Uuid::new_v4(),
            business_area_id: area.id,
            name: "Cash-2024".into(),
            status: "ACTIVE".into(),
        };
        insert_program(&mut conn, &program).await.unwrap();

        assert_eq!(load_business_area(&mut conn, area.id).await.unwrap(), Some(area));
        assert_eq!(load_program(&mut conn, program.id).await.unwrap(), Some(program));
        assert!(load_program(&mut conn, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dedup_document_types() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        for (key, dedup) in [("national_id", true), ("birth_certificate", false)] {
            upsert_document_type(
                &mut conn,
                &DocumentType {
                    key: key.into(),
                    label: key.into(),
                    valid_for_deduplication: dedup,
                },
            )
            .await
            .unwrap();
        }

        let keys = dedup_document_types(&mut conn).await.unwrap();
        assert!(keys.contains("national_id"));
        assert!(!keys.contains("birth_certificate"));
    }
}
