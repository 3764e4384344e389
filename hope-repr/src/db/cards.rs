//! Household entitlement cards

use hope_common::db::{MergeScope, MergeStatus};
use hope_common::Result;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use super::{now_text, opt_text, parse_opt_uuid, parse_uuid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementCard {
    pub id: Uuid,
    pub household_id: Uuid,
    pub card_number: String,
    pub card_type: String,
    pub status: String,
    pub copied_from_id: Option<Uuid>,
    pub rdi_merge_status: MergeStatus,
}

pub async fn insert_card(conn: &mut SqliteConnection, card: &EntitlementCard) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entitlement_cards
            (id, household_id, card_number, card_type, status, copied_from_id,
             rdi_merge_status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(card.id.to_string())
    .bind(card.household_id.to_string())
    .bind(&card.card_number)
    .bind(&card.card_type)
    .bind(&card.status)
    .bind(opt_text(card.copied_from_id))
    .bind(card.rdi_merge_status.as_str())
    .bind(now_text())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn cards_of_household(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<EntitlementCard>> {
    let sql = format!(
        "SELECT id, household_id, card_number, card_type, status, copied_from_id, rdi_merge_status \
         FROM entitlement_cards WHERE household_id = ? AND {} ORDER BY created_at, id",
        scope.predicate("rdi_merge_status")
    );
    let rows = sqlx::query(&sql)
        .bind(household_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let household_id: String = row.get("household_id");
            let status: String = row.get("rdi_merge_status");
            Ok(EntitlementCard {
                id: parse_uuid(&id)?,
                household_id: parse_uuid(&household_id)?,
                card_number: row.get("card_number"),
                card_type: row.get("card_type"),
                status: row.get("status"),
                copied_from_id: parse_opt_uuid(row.get("copied_from_id"))?,
                rdi_merge_status: status.parse()?,
            })
        })
        .collect()
}

pub async fn copy_cards(
    conn: &mut SqliteConnection,
    source_household_id: Uuid,
    new_household_id: Uuid,
    merge_status: MergeStatus,
) -> Result<usize> {
    let sources = cards_of_household(conn, source_household_id, MergeScope::Any).await?;
    if sources.is_empty() {
        return Ok(0);
    }

    let created_at = now_text();
    let mut builder = QueryBuilder::<Sqlite>::new(
        "INSERT INTO entitlement_cards (id, household_id, card_number, card_type, status, \
         copied_from_id, rdi_merge_status, created_at) ",
    );
    builder.push_values(&sources, |mut b, card| {
        b.push_bind(Uuid::new_v4().to_string())
            .push_bind(new_household_id.to_string())
            .push_bind(card.card_number.clone())
            .push_bind(card.card_type.clone())
            .push_bind(card.status.clone())
            .push_bind(card.id.to_string())
            .push_bind(merge_status.as_str())
            .push_bind(created_at.clone());
    });
    builder.build().execute(&mut *conn).await?;

    Ok(sources.len())
}

pub async fn promote_for_household(conn: &mut SqliteConnection, household_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE entitlement_cards SET rdi_merge_status = 'MERGED' WHERE household_id = ? AND \
         rdi_merge_status = 'PENDING'",
    )
    .bind(household_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
