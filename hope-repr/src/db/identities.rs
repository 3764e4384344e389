//! Partner identity records (e.g. UNHCR, WFP numbers)

use hope_common::db::{MergeScope, MergeStatus};
use hope_common::Result;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use super::{now_text, opt_text, parse_opt_uuid, parse_uuid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub individual_id: Uuid,
    pub partner: String,
    pub number: String,
    pub country: Option<String>,
    pub copied_from_id: Option<Uuid>,
    pub rdi_merge_status: MergeStatus,
}

pub async fn insert_identity(conn: &mut SqliteConnection, identity: &IdentityRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO identities
            (id, individual_id, partner, number, country, copied_from_id,
             rdi_merge_status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(identity.id.to_string())
    .bind(identity.individual_id.to_string())
    .bind(&identity.partner)
    .bind(&identity.number)
    .bind(&identity.country)
    .bind(opt_text(identity.copied_from_id))
    .bind(identity.rdi_merge_status.as_str())
    .bind(now_text())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn identities_of_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<IdentityRecord>> {
    let sql = format!(
        "SELECT id, individual_id, partner, number, country, copied_from_id, rdi_merge_status \
         FROM identities WHERE individual_id = ? AND {} ORDER BY created_at, id",
        scope.predicate("rdi_merge_status")
    );
    let rows = sqlx::query(&sql)
        .bind(individual_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let individual_id: String = row.get("individual_id");
            let status: String = row.get("rdi_merge_status");
            Ok(IdentityRecord {
                id: parse_uuid(&id)?,
                individual_id: parse_uuid(&individual_id)?,
                partner: row.get("partner"),
                number: row.get("number"),
                country: row.get("country"),
                copied_from_id: parse_opt_uuid(row.get("copied_from_id"))?,
                rdi_merge_status: status.parse()?,
            })
        })
        .collect()
}

pub async fn copy_identities(
    conn: &mut SqliteConnection,
    source_individual_id: Uuid,
    new_individual_id: Uuid,
    merge_status: MergeStatus,
) -> Result<usize> {
    let sources = identities_of_individual(conn, source_individual_id, MergeScope::Any).await?;
    if sources.is_empty() {
        return Ok(0);
    }

    let created_at = now_text();
    let mut builder = QueryBuilder::<Sqlite>::new(
        "INSERT INTO identities (id, individual_id, partner, number, country, copied_from_id, \
         rdi_merge_status, created_at) ",
    );
    builder.push_values(&sources, |mut b, identity| {
        b.push_bind(Uuid::new_v4().to_string())
            .push_bind(new_individual_id.to_string())
            .push_bind(identity.partner.clone())
            .push_bind(identity.number.clone())
            .push_bind(identity.country.clone())
            .push_bind(identity.id.to_string())
            .push_bind(merge_status.as_str())
            .push_bind(created_at.clone());
    });
    builder.build().execute(&mut *conn).await?;

    Ok(sources.len())
}

pub async fn promote_for_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE identities SET rdi_merge_status = 'MERGED' WHERE individual_id = ? AND \
         rdi_merge_status = 'PENDING'",
    )
    .bind(individual_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
