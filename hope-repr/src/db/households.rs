//! Household persistence

use hope_common::db::{MergeScope, MergeStatus};
use hope_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{now_text, opt_text, parse_opt_uuid, parse_time, parse_uuid};

const COLUMNS: &str = "id, unicef_id, business_area_id, program_id, registration_import_id, \
     collection_id, copied_from_id, origin_unicef_id, head_of_household_id, size, address, \
     withdrawn, rdi_merge_status, created_at";

/// Household row
#[derive(Debug, Clone, PartialEq)]
pub struct Household {
    pub id: Uuid,
    pub unicef_id: String,
    pub business_area_id: Uuid,
    /// None: registered at business-area level, not enrolled in any program
    pub program_id: Option<Uuid>,
    pub registration_import_id: Option<Uuid>,
    /// None: never copied
    pub collection_id: Option<Uuid>,
    /// Some(own id) for a row adjusted in place, Some(other) for a copy
    pub copied_from_id: Option<Uuid>,
    pub origin_unicef_id: Option<String>,
    /// None: no head assigned (household without members)
    pub head_of_household_id: Option<Uuid>,
    pub size: Option<i64>,
    pub address: Option<String>,
    pub withdrawn: bool,
    pub rdi_merge_status: MergeStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Household {
    /// New unscoped household waiting for import merge
    pub fn new(unicef_id: impl Into<String>, business_area_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            unicef_id: unicef_id.into(),
            business_area_id,
            program_id: None,
            registration_import_id: None,
            collection_id: None,
            copied_from_id: None,
            origin_unicef_id: None,
            head_of_household_id: None,
            size: None,
            address: None,
            withdrawn: false,
            rdi_merge_status: MergeStatus::Pending,
            created_at: chrono::Utc::now(),
        }
    }

    /// Whether this row was produced by copying another row
    pub fn is_copy(&self) -> bool {
        matches!(self.copied_from_id, Some(origin) if origin != self.id)
    }
}

fn from_row(row: &SqliteRow) -> Result<Household> {
    let id: String = row.get("id");
    let business_area_id: String = row.get("business_area_id");
    let status: String = row.get("rdi_merge_status");
    let created_at: String = row.get("created_at");

    Ok(Household {
        id: parse_uuid(&id)?,
        unicef_id: row.get("unicef_id"),
        business_area_id: parse_uuid(&business_area_id)?,
        program_id: parse_opt_uuid(row.get("program_id"))?,
        registration_import_id: parse_opt_uuid(row.get("registration_import_id"))?,
        collection_id: parse_opt_uuid(row.get("collection_id"))?,
        copied_from_id: parse_opt_uuid(row.get("copied_from_id"))?,
        origin_unicef_id: row.get("origin_unicef_id"),
        head_of_household_id: parse_opt_uuid(row.get("head_of_household_id"))?,
        size: row.get("size"),
        address: row.get("address"),
        withdrawn: row.get::<i64, _>("withdrawn") != 0,
        rdi_merge_status: status.parse()?,
        created_at: parse_time(&created_at)?,
    })
}

/// Load household by id within the given merge scope
pub async fn load_household(
    conn: &mut SqliteConnection,
    id: Uuid,
    scope: MergeScope,
) -> Result<Option<Household>> {
    let sql = format!(
        "SELECT {} FROM households WHERE id = ? AND {}",
        COLUMNS,
        scope.predicate("rdi_merge_status")
    );
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(from_row).transpose()
}

pub async fn insert_household(conn: &mut SqliteConnection, household: &Household) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO households (
            id, unicef_id, business_area_id, program_id, registration_import_id, collection_id,
            copied_from_id, origin_unicef_id, head_of_household_id, size, address, withdrawn,
            rdi_merge_status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(household.id.to_string())
    .bind(&household.unicef_id)
    .bind(household.business_area_id.to_string())
    .bind(opt_text(household.program_id))
    .bind(opt_text(household.registration_import_id))
    .bind(opt_text(household.collection_id))
    .bind(opt_text(household.copied_from_id))
    .bind(&household.origin_unicef_id)
    .bind(opt_text(household.head_of_household_id))
    .bind(household.size)
    .bind(&household.address)
    .bind(household.withdrawn)
    .bind(household.rdi_merge_status.as_str())
    .bind(super::to_text(household.created_at))
    .bind(now_text())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// First-representation adjustment: move the row into `program_id` and
/// make it its own origin
pub async fn adjust_in_place(
    conn: &mut SqliteConnection,
    id: Uuid,
    program_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE households
        SET program_id = ?,
            copied_from_id = id,
            origin_unicef_id = COALESCE(origin_unicef_id, unicef_id),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(program_id.to_string())
    .bind(now_text())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn set_head(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    head: Option<Uuid>,
) -> Result<()> {
    sqlx::query("UPDATE households SET head_of_household_id = ?, updated_at = ? WHERE id = ?")
        .bind(opt_text(head))
        .bind(now_text())
        .bind(household_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn mark_withdrawn(conn: &mut SqliteConnection, household_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE households SET withdrawn = 1, updated_at = ? WHERE id = ?")
        .bind(now_text())
        .bind(household_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Households whose head is `individual_id`
pub async fn headed_by(conn: &mut SqliteConnection, individual_id: Uuid) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM households WHERE head_of_household_id = ? AND rdi_merge_status <> \
         'REMOVED' ORDER BY id",
    )
    .bind(individual_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    ids.iter().map(|s| parse_uuid(s)).collect()
}

/// Household ids registered by an import, oldest first
pub async fn ids_for_import(
    conn: &mut SqliteConnection,
    import_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<Uuid>> {
    let sql = format!(
        "SELECT id FROM households WHERE registration_import_id = ? AND {} ORDER BY created_at, id",
        scope.predicate("rdi_merge_status")
    );
    let ids: Vec<String> = sqlx::query_scalar(&sql)
        .bind(import_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

    ids.iter().map(|s| parse_uuid(s)).collect()
}

/// PENDING → MERGED for one household. Returns false if it was not pending.
pub async fn promote_to_merged(conn: &mut SqliteConnection, household_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE households SET rdi_merge_status = 'MERGED', updated_at = ? WHERE id = ? AND \
         rdi_merge_status = 'PENDING'",
    )
    .bind(now_text())
    .bind(household_id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::programs::{insert_business_area, BusinessArea};
    use hope_common::db::open_in_memory;

    #[tokio::test]
    async fn test_insert_load_and_adjust() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "ukraine".into(),
            name: "Ukraine".into(),
            postpone_deduplication: false,
        };
        insert_business_area(&mut conn, &area).await.unwrap();

        let mut household = Household::new("HH-0001", area.id);
        household.rdi_merge_status = MergeStatus::Merged;
        insert_household(&mut conn, &household).await.unwrap();

        let loaded = load_household(&mut conn, household.id, MergeScope::Merged)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.unicef_id, "HH-0001");
        assert!(!loaded.is_copy());
        assert!(load_household(&mut conn, household.id, MergeScope::Pending).await.unwrap()
            .is_none());

        let program_id = Uuid::new_v4();
        sqlx::query("INSERT INTO programs (id, business_area_id, name) VALUES (?, ?, 'P')")
            .bind(program_id.to_string())
            .bind(area.id.to_string())
            .execute(&mut *conn)
            .await
            .unwrap();
        adjust_in_place(&mut conn, household.id, program_id).await.unwrap();

        let adjusted = load_household(&mut conn, household.id, MergeScope::Any)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(adjusted.program_id, Some(program_id));
        assert_eq!(adjusted.copied_from_id, Some(household.id));
        assert_eq!(adjusted.origin_unicef_id.as_deref(), Some("HH-0001"));
        assert!(!adjusted.is_copy(), "in-place row is the original, not a copy");
    }
}
