//! Identity documents and matching-key lookups

use hope_common::db::{DocumentStatus, MergeScope, MergeStatus};
use hope_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::fmt;
use uuid::Uuid;

use super::{now_text, opt_text, parse_opt_uuid, parse_time, parse_uuid, to_text};

const COLUMNS: &str = "d.id, d.individual_id, d.program_id, d.type_key, d.document_number, \
     d.country, d.status, d.copied_from_id, d.rdi_merge_status, d.created_at";

/// (document number, document type, country)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchingKey {
    pub document_number: String,
    pub type_key: String,
    pub country: String,
}

impl MatchingKey {
    pub fn new(
        document_number: impl Into<String>,
        type_key: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            document_number: document_number.into(),
            type_key: type_key.into(),
            country: country.into(),
        }
    }
}

impl fmt::Display for MatchingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.document_number, self.type_key, self.country)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: Uuid,
    pub individual_id: Uuid,
    pub program_id: Option<Uuid>,
    pub type_key: String,
    pub document_number: String,
    pub country: String,
    pub status: DocumentStatus,
    pub copied_from_id: Option<Uuid>,
    pub rdi_merge_status: MergeStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Document {
    pub fn new(individual_id: Uuid, program_id: Option<Uuid>, key: &MatchingKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            individual_id,
            program_id,
            type_key: key.type_key.clone(),
            document_number: key.document_number.clone(),
            country: key.country.clone(),
            status: DocumentStatus::Pending,
            copied_from_id: None,
            rdi_merge_status: MergeStatus::Pending,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn matching_key(&self) -> MatchingKey {
        MatchingKey::new(&self.document_number, &self.type_key, &self.country)
    }
}

/// A document in a deduplication window with what dedup needs of its owner
#[derive(Debug, Clone)]
pub struct DocumentMatch {
    pub document: Document,
    /// Owner's collection, None when the owner was never copied
    pub owner_collection_id: Option<Uuid>,
    pub owner_created_at: chrono::DateTime<chrono::Utc>,
}

impl DocumentMatch {
    /// Owner's lineage: collection id, or the owner's own id
    pub fn lineage_key(&self) -> Uuid {
        self.owner_collection_id.unwrap_or(self.document.individual_id)
    }
}

fn from_row(row: &SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let individual_id: String = row.get("individual_id");
    let status: String = row.get("status");
    let merge_status: String = row.get("rdi_merge_status");
    let created_at: String = row.get("created_at");

    Ok(Document {
        id: parse_uuid(&id)?,
        individual_id: parse_uuid(&individual_id)?,
        program_id: parse_opt_uuid(row.get("program_id"))?,
        type_key: row.get("type_key"),
        document_number: row.get("document_number"),
        country: row.get("country"),
        status: status.parse()?,
        copied_from_id: parse_opt_uuid(row.get("copied_from_id"))?,
        rdi_merge_status: merge_status.parse()?,
        created_at: parse_time(&created_at)?,
    })
}

pub async fn insert_document(conn: &mut SqliteConnection, document: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (
            id, individual_id, program_id, type_key, document_number, country, status,
            copied_from_id, rdi_merge_status, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(document.id.to_string())
    .bind(document.individual_id.to_string())
    .bind(opt_text(document.program_id))
    .bind(&document.type_key)
    .bind(&document.document_number)
    .bind(&document.country)
    .bind(document.status.as_str())
    .bind(opt_text(document.copied_from_id))
    .bind(document.rdi_merge_status.as_str())
    .bind(to_text(document.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn load_document(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Document>> {
    let sql = format!("SELECT {} FROM documents d WHERE d.id = ?", COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn documents_of_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<Document>> {
    let sql = format!(
        "SELECT {} FROM documents d WHERE d.individual_id = ? AND {} ORDER BY d.created_at, d.id",
        COLUMNS,
        scope.predicate("d.rdi_merge_status")
    );
    let rows = sqlx::query(&sql)
        .bind(individual_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Deduplication window for one matching key.
///
/// Merged documents in the business area (and program, when given) whose
/// status is still undecided or VALID and whose owner is not a duplicate.
/// Ordered by document creation, then id.
pub async fn load_matching(
    conn: &mut SqliteConnection,
    key: &MatchingKey,
    business_area_id: Uuid,
    program_id: Option<Uuid>,
) -> Result<Vec<DocumentMatch>> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {}, i.collection_id AS owner_collection_id, i.created_at AS owner_created_at \
         FROM documents d JOIN individuals i ON i.id = d.individual_id \
         WHERE d.document_number = ",
        COLUMNS
    ));
    builder.push_bind(key.document_number.clone());
    builder.push(" AND d.type_key = ");
    builder.push_bind(key.type_key.clone());
    builder.push(" AND d.country = ");
    builder.push_bind(key.country.clone());
    builder.push(" AND i.business_area_id = ");
    builder.push_bind(business_area_id.to_string());
    if let Some(program_id) = program_id {
        builder.push(" AND d.program_id = ");
        builder.push_bind(program_id.to_string());
    }
    builder.push(
        " AND d.rdi_merge_status = 'MERGED' \
          AND d.status IN ('PENDING', 'VALID', 'NEED_INVESTIGATION') \
          AND i.duplicate = 0 AND i.rdi_merge_status <> 'REMOVED' \
          ORDER BY d.created_at, d.id",
    );

    let rows = builder.build().fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            let owner_created_at: String = row.get("owner_created_at");
            Ok(DocumentMatch {
                document: from_row(row)?,
                owner_collection_id: parse_opt_uuid(row.get("owner_collection_id"))?,
                owner_created_at: parse_time(&owner_created_at)?,
            })
        })
        .collect()
}

/// Set one status on many documents
pub async fn set_status(
    conn: &mut SqliteConnection,
    ids: &[Uuid],
    status: DocumentStatus,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE documents SET status = ");
    builder.push_bind(status.as_str());
    builder.push(" WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated(")");

    let result = builder.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

/// Invalidate every live document of an individual (duplicate marking)
pub async fn invalidate_for_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE documents SET status = 'INVALID' WHERE individual_id = ? AND rdi_merge_status <> \
         'REMOVED' AND status <> 'INVALID'",
    )
    .bind(individual_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// NEED_INVESTIGATION → VALID for one document unless another VALID merged
/// document already holds the same key in its program.
/// Returns false when the key is still taken.
pub async fn restore_valid(conn: &mut SqliteConnection, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE documents SET status = 'VALID'
        WHERE id = ? AND status = 'NEED_INVESTIGATION'
          AND NOT EXISTS (
              SELECT 1 FROM documents other
              WHERE other.id <> documents.id
                AND other.document_number = documents.document_number
                AND other.type_key = documents.type_key
                AND other.country = documents.country
                AND other.program_id IS documents.program_id
                AND other.status = 'VALID'
                AND other.rdi_merge_status = 'MERGED'
          )
        "#,
    )
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Copy every live document of `source_individual_id` onto a new owner.
/// Returns the number of rows written.
pub async fn copy_documents(
    conn: &mut SqliteConnection,
    source_individual_id: Uuid,
    new_individual_id: Uuid,
    program_id: Uuid,
    merge_status: MergeStatus,
) -> Result<usize> {
    let sources = documents_of_individual(conn, source_individual_id, MergeScope::Any).await?;
    if sources.is_empty() {
        return Ok(0);
    }

    let created_at = now_text();
    let mut builder = QueryBuilder::<Sqlite>::new(
        "INSERT INTO documents (id, individual_id, program_id, type_key, document_number, \
         country, status, copied_from_id, rdi_merge_status, created_at) ",
    );
    builder.push_values(&sources, |mut b, doc| {
        b.push_bind(Uuid::new_v4().to_string())
            .push_bind(new_individual_id.to_string())
            .push_bind(program_id.to_string())
            .push_bind(doc.type_key.clone())
            .push_bind(doc.document_number.clone())
            .push_bind(doc.country.clone())
            .push_bind(doc.status.as_str())
            .push_bind(doc.id.to_string())
            .push_bind(merge_status.as_str())
            .push_bind(created_at.clone());
    });
    builder.build().execute(&mut *conn).await?;

    Ok(sources.len())
}

/// PENDING → MERGED for all documents of an individual
pub async fn promote_for_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE documents SET rdi_merge_status = 'MERGED' WHERE individual_id = ? AND \
         rdi_merge_status = 'PENDING'",
    )
    .bind(individual_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Merged, still undecided documents owned by individuals of an import
pub async fn pending_decision_for_import(
    conn: &mut SqliteConnection,
    import_id: Uuid,
) -> Result<Vec<Document>> {
    let sql = format!(
        "SELECT {} FROM documents d JOIN individuals i ON i.id = d.individual_id \
         WHERE i.registration_import_id = ? AND d.rdi_merge_status = 'MERGED' \
         AND d.status = 'PENDING' ORDER BY d.created_at, d.id",
        COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(import_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Merged, still undecided documents of a business area, optionally narrowed
/// to one program
pub async fn pending_decision_in_area(
    conn: &mut SqliteConnection,
    business_area_id: Uuid,
    program_id: Option<Uuid>,
) -> Result<Vec<Document>> {
    let sql = format!(
        "SELECT {} FROM documents d JOIN individuals i ON i.id = d.individual_id \
         WHERE i.business_area_id = ? AND (? IS NULL OR d.program_id = ?) \
         AND d.rdi_merge_status = 'MERGED' AND d.status = 'PENDING' \
         ORDER BY d.created_at, d.id",
        COLUMNS
    );
    let program = program_id.map(|p| p.to_string());
    let rows = sqlx::query(&sql)
        .bind(business_area_id.to_string())
        .bind(program.clone())
        .bind(program)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::individuals::{insert_individual, Individual};
    use crate::db::programs::{
        insert_business_area, upsert_document_type, BusinessArea, DocumentType,
    };
    use hope_common::db::open_in_memory;
    use hope_common::Error;

    struct Fixture {
        pool: sqlx::SqlitePool,
        area: Uuid,
    }

    async fn fixture() -> Fixture {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "afghanistan".into(),
            name: "Afghanistan".into(),
            postpone_deduplication: false,
        };
        insert_business_area(&mut conn, &area).await.unwrap();
        upsert_document_type(
            &mut conn,
            &DocumentType {
                key: "national_id".into(),
                label: "National ID".into(),
                valid_for_deduplication: true,
            },
        )
        .await
        .unwrap();
        drop(conn);
        Fixture { pool, area: area.id }
    }

    async fn person(conn: &mut SqliteConnection, area: Uuid, name: &str) -> Individual {
        let mut individual = Individual::new(format!("IND-{}", name), name, area);
        individual.rdi_merge_status = MergeStatus::Merged;
        insert_individual(conn, &individual).await.unwrap();
        individual
    }

    #[tokio::test]
    async fn test_valid_matching_key_is_unique() {
        let f = fixture().await;
        let mut conn = f.pool.acquire().await.unwrap();
        let key = MatchingKey::new("AB123", "national_id", "AFG");
        let x = person(&mut conn, f.area, "X").await;
        let y = person(&mut conn, f.area, "Y").await;

        let program = Uuid::new_v4();
        sqlx::query("INSERT INTO programs (id, business_area_id, name) VALUES (?, ?, 'Cash-2024')")
            .bind(program.to_string())
            .bind(f.area.to_string())
            .execute(&mut *conn)
            .await
            .unwrap();

        let mut first = Document::new(x.id, Some(program), &key);
        first.status = DocumentStatus::Valid;
        first.rdi_merge_status = MergeStatus::Merged;
        insert_document(&mut conn, &first).await.unwrap();

        let mut second = Document::new(y.id, Some(program), &key);
        second.status = DocumentStatus::NeedInvestigation;
        second.rdi_merge_status = MergeStatus::Merged;
        insert_document(&mut conn, &second).await.unwrap();

        let err = set_status(&mut conn, &[second.id], DocumentStatus::Valid)
            .await
            .unwrap_err()
            .classify();
        assert!(matches!(err, Error::DuplicateConstraint { .. }), "got {:?}", err);

        assert!(!restore_valid(&mut conn, second.id).await.unwrap());
        set_status(&mut conn, &[first.id], DocumentStatus::Invalid).await.unwrap();
        assert!(restore_valid(&mut conn, second.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_matching_window() {
        let f = fixture().await;
        let mut conn = f.pool.acquire().await.unwrap();
        let key = MatchingKey::new("AB123", "national_id", "AFG");
        let x = person(&mut conn, f.area, "X").await;

        let mut merged = Document::new(x.id, None, &key);
        merged.rdi_merge_status = MergeStatus::Merged;
        insert_document(&mut conn, &merged).await.unwrap();
        // Still pending merge: outside the window
        insert_document(&mut conn, &Document::new(x.id, None, &key)).await.unwrap();
        let mut invalid = Document::new(x.id, None, &key);
        invalid.rdi_merge_status = MergeStatus::Merged;
        invalid.status = DocumentStatus::Invalid;
        insert_document(&mut conn, &invalid).await.unwrap();

        let window = load_matching(&mut conn, &key, f.area, None).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].document.id, merged.id);
        assert_eq!(window[0].lineage_key(), x.id);
        assert_eq!(key.to_string(), "AB123|national_id|AFG");
    }

    #[tokio::test]
    async fn test_copy_documents_keeps_origin_link() {
        let f = fixture().await;
        let mut conn = f.pool.acquire().await.unwrap();
        let key = MatchingKey::new("P-77", "national_id", "AFG");
        let x = person(&mut conn, f.area, "X").await;
        let copy = person(&mut conn, f.area, "X2").await;
        let doc = Document::new(x.id, None, &key);
        insert_document(&mut conn, &doc).await.unwrap();

        let program = Uuid::new_v4();
        sqlx::query("INSERT INTO programs (id, business_area_id, name) VALUES (?, ?, 'Cash-2025')")
            .bind(program.to_string())
            .bind(f.area.to_string())
            .execute(&mut *conn)
            .await
            .unwrap();

        let written = copy_documents(&mut conn, x.id, copy.id, program, MergeStatus::Merged)
            .await
            .unwrap();
        assert_eq!(written, 1);
        let copied = documents_of_individual(&mut conn, copy.id, MergeScope::Merged).await.unwrap();
        assert_eq!(copied[0].copied_from_id, Some(doc.id));
        assert_eq!(copied[0].program_id, Some(program));
    }
}
