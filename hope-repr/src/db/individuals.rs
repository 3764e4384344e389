//! Individual persistence

use hope_common::db::{MergeScope, MergeStatus, RELATIONSHIP_HEAD, RELATIONSHIP_UNKNOWN};
use hope_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{now_text, opt_text, parse_opt_uuid, parse_time, parse_uuid, to_text};

const COLUMNS: &str = "id, unicef_id, household_id, business_area_id, program_id, \
     registration_import_id, collection_id, copied_from_id, origin_unicef_id, full_name, \
     birth_date, relationship, withdrawn, duplicate, unique_individual_id, rdi_merge_status, \
     created_at";

/// Individual row
#[derive(Debug, Clone, PartialEq)]
pub struct Individual {
    pub id: Uuid,
    pub unicef_id: String,
    /// None: external collector or orphan, not a member of any household
    pub household_id: Option<Uuid>,
    pub business_area_id: Uuid,
    /// None: registered at business-area level, not enrolled in any program
    pub program_id: Option<Uuid>,
    pub registration_import_id: Option<Uuid>,
    /// None: never copied
    pub collection_id: Option<Uuid>,
    pub copied_from_id: Option<Uuid>,
    pub origin_unicef_id: Option<String>,
    pub full_name: String,
    pub birth_date: Option<String>,
    pub relationship: String,
    pub withdrawn: bool,
    pub duplicate: bool,
    /// Set together with `duplicate`
    pub unique_individual_id: Option<Uuid>,
    pub rdi_merge_status: MergeStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Individual {
    pub fn new(
        unicef_id: impl Into<String>,
        full_name: impl Into<String>,
        business_area_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            unicef_id: unicef_id.into(),
            household_id: None,
            business_area_id,
            program_id: None,
            registration_import_id: None,
            collection_id: None,
            copied_from_id: None,
            origin_unicef_id: None,
            full_name: full_name.into(),
            birth_date: None,
            relationship: RELATIONSHIP_UNKNOWN.to_string(),
            withdrawn: false,
            duplicate: false,
            unique_individual_id: None,
            rdi_merge_status: MergeStatus::Pending,
            created_at: chrono::Utc::now(),
        }
    }

    /// Neither withdrawn nor marked duplicate
    pub fn is_active(&self) -> bool {
        !self.withdrawn && !self.duplicate
    }

    /// Identifies one real-world person across programs
    pub fn lineage_key(&self) -> Uuid {
        self.collection_id.unwrap_or(self.id)
    }

    pub fn is_copy(&self) -> bool {
        matches!(self.copied_from_id, Some(origin) if origin != self.id)
    }

    pub fn is_head(&self) -> bool {
        self.relationship == RELATIONSHIP_HEAD
    }
}

fn from_row(row: &SqliteRow) -> Result<Individual> {
    let id: String = row.get("id");
    let business_area_id: String = row.get("business_area_id");
    let status: String = row.get("rdi_merge_status");
    let created_at: String = row.get("created_at");

    Ok(Individual {
        id: parse_uuid(&id)?,
        unicef_id: row.get("unicef_id"),
        household_id: parse_opt_uuid(row.get("household_id"))?,
        business_area_id: parse_uuid(&business_area_id)?,
        program_id: parse_opt_uuid(row.get("program_id"))?,
        registration_import_id: parse_opt_uuid(row.get("registration_import_id"))?,
        collection_id: parse_opt_uuid(row.get("collection_id"))?,
        copied_from_id: parse_opt_uuid(row.get("copied_from_id"))?,
        origin_unicef_id: row.get("origin_unicef_id"),
        full_name: row.get("full_name"),
        birth_date: row.get("birth_date"),
        relationship: row.get("relationship"),
        withdrawn: row.get::<i64, _>("withdrawn") != 0,
        duplicate: row.get::<i64, _>("duplicate") != 0,
        unique_individual_id: parse_opt_uuid(row.get("unique_individual_id"))?,
        rdi_merge_status: status.parse()?,
        created_at: parse_time(&created_at)?,
    })
}

pub async fn load_individual(
    conn: &mut SqliteConnection,
    id: Uuid,
    scope: MergeScope,
) -> Result<Option<Individual>> {
    let sql = format!(
        "SELECT {} FROM individuals WHERE id = ? AND {}",
        COLUMNS,
        scope.predicate("rdi_merge_status")
    );
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.as_ref().map(from_row).transpose()
}

/// Members of a household, oldest first
pub async fn load_members(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<Individual>> {
    let sql = format!(
        "SELECT {} FROM individuals WHERE household_id = ? AND {} ORDER BY created_at, id",
        COLUMNS,
        scope.predicate("rdi_merge_status")
    );
    let rows = sqlx::query(&sql)
        .bind(household_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

    rows.iter().map(from_row).collect()
}

pub async fn insert_individual(conn: &mut SqliteConnection, individual: &Individual) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO individuals (
            id, unicef_id, household_id, business_area_id, program_id, registration_import_id,
            collection_id, copied_from_id, origin_unicef_id, full_name, birth_date, relationship,
            withdrawn, duplicate, unique_individual_id, rdi_merge_status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(individual.id.to_string())
    .bind(&individual.unicef_id)
    .bind(opt_text(individual.household_id))
    .bind(individual.business_area_id.to_string())
    .bind(opt_text(individual.program_id))
    .bind(opt_text(individual.registration_import_id))
    .bind(opt_text(individual.collection_id))
    .bind(opt_text(individual.copied_from_id))
    .bind(&individual.origin_unicef_id)
    .bind(&individual.full_name)
    .bind(&individual.birth_date)
    .bind(&individual.relationship)
    .bind(individual.withdrawn)
    .bind(individual.duplicate)
    .bind(opt_text(individual.unique_individual_id))
    .bind(individual.rdi_merge_status.as_str())
    .bind(to_text(individual.created_at))
    .bind(now_text())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// First-representation adjustment, see [`super::households::adjust_in_place`].
/// Documents follow the owner into the program.
pub async fn adjust_in_place(
    conn: &mut SqliteConnection,
    id: Uuid,
    program_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE individuals
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

    sqlx::query(
        "UPDATE documents SET program_id = ? WHERE individual_id = ? AND program_id IS NULL",
    )
    .bind(program_id.to_string())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Attach an individual to a household if it has none yet
pub async fn attach_to_household(
    conn: &mut SqliteConnection,
    id: Uuid,
    household_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE individuals SET household_id = ?, updated_at = ? WHERE id = ? AND household_id IS \
         NULL",
    )
    .bind(household_id.to_string())
    .bind(now_text())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_relationship(
    conn: &mut SqliteConnection,
    id: Uuid,
    relationship: &str,
) -> Result<()> {
    sqlx::query("UPDATE individuals SET relationship = ?, updated_at = ? WHERE id = ?")
        .bind(relationship)
        .bind(now_text())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Demote every member of `household_id` except `keep` to UNKNOWN.
/// Returns the demoted ids.
pub async fn demote_other_members(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    keep: Uuid,
) -> Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM individuals WHERE household_id = ? AND id <> ? AND relationship <> ? AND \
         rdi_merge_status <> 'REMOVED'",
    )
    .bind(household_id.to_string())
    .bind(keep.to_string())
    .bind(RELATIONSHIP_UNKNOWN)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE individuals SET relationship = ?, updated_at = ? WHERE household_id = ? AND id <> \
         ? AND rdi_merge_status <> 'REMOVED'",
    )
    .bind(RELATIONSHIP_UNKNOWN)
    .bind(now_text())
    .bind(household_id.to_string())
    .bind(keep.to_string())
    .execute(&mut *conn)
    .await?;

    ids.iter().map(|s| parse_uuid(s)).collect()
}

/// Active, non-removed members of a household
pub async fn active_member_count(conn: &mut SqliteConnection, household_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM individuals
        WHERE household_id = ? AND withdrawn = 0 AND duplicate = 0 AND rdi_merge_status <> 'REMOVED'
        "#,
    )
    .bind(household_id.to_string())
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

pub async fn mark_withdrawn(conn: &mut SqliteConnection, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE individuals SET withdrawn = 1, updated_at = ? WHERE id = ?")
        .bind(now_text())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn mark_duplicate(
    conn: &mut SqliteConnection,
    id: Uuid,
    unique_individual_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE individuals SET duplicate = 1, unique_individual_id = ?, updated_at = ? WHERE id = \
         ?",
    )
    .bind(unique_individual_id.to_string())
    .bind(now_text())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Individuals of an import that are not members of any of its households
pub async fn orphan_ids_for_import(
    conn: &mut SqliteConnection,
    import_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<Uuid>> {
    let sql = format!(
        "SELECT id FROM individuals WHERE registration_import_id = ? AND household_id IS NULL AND \
         {} ORDER BY created_at, id",
        scope.predicate("rdi_merge_status")
    );
    let ids: Vec<String> = sqlx::query_scalar(&sql)
        .bind(import_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

    ids.iter().map(|s| parse_uuid(s)).collect()
}

/// PENDING → MERGED for one individual
pub async fn promote_to_merged(conn: &mut SqliteConnection, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE individuals SET rdi_merge_status = 'MERGED', updated_at = ? WHERE id = ? AND \
         rdi_merge_status = 'PENDING'",
    )
    .bind(now_text())
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::households::{insert_household, Household};
    use crate::db::programs::{insert_business_area, BusinessArea};
    use hope_common::db::open_in_memory;

    async fn area(conn: &mut SqliteConnection) -> Uuid {
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "somalia".into(),
            name: "Somalia".into(),
            postpone_deduplication: false,
        };
        insert_business_area(conn, &area).await.unwrap();
        area.id
    }

    #[tokio::test]
    async fn test_members_and_active_count() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let ba = area(&mut conn).await;

        let household = Household::new("HH-1", ba);
        insert_household(&mut conn, &household).await.unwrap();

        let mut ids = Vec::new();
        for name in ["Amina", "Omar", "Hodan"] {
            let mut member = Individual::new(format!("IND-{}", name), name, ba);
            member.household_id = Some(household.id);
            insert_individual(&mut conn, &member).await.unwrap();
            ids.push(member.id);
        }

        let members = load_members(&mut conn, household.id, MergeScope::Pending).await.unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(active_member_count(&mut conn, household.id).await.unwrap(), 3);

        mark_withdrawn(&mut conn, ids[0]).await.unwrap();
        mark_duplicate(&mut conn, ids[1], ids[2]).await.unwrap();
        assert_eq!(active_member_count(&mut conn, household.id).await.unwrap(), 1);

        let dup = load_individual(&mut conn, ids[1], MergeScope::Any).await.unwrap().unwrap();
        assert!(!dup.is_active());
        assert_eq!(dup.unique_individual_id, Some(ids[2]));
    }

    #[tokio::test]
    async fn test_demote_other_members() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let ba = area(&mut conn).await;
        let household = Household::new("HH-2", ba);
        insert_household(&mut conn, &household).await.unwrap();

        let mut head = Individual::new("IND-A", "A", ba);
        head.household_id = Some(household.id);
        head.relationship = RELATIONSHIP_HEAD.into();
        insert_individual(&mut conn, &head).await.unwrap();
        let mut other = Individual::new("IND-B", "B", ba);
        other.household_id = Some(household.id);
        insert_individual(&mut conn, &other).await.unwrap();

        let demoted = demote_other_members(&mut conn, household.id, other.id).await.unwrap();
        assert_eq!(demoted, vec![head.id]);
        let reloaded = load_individual(&mut conn, head.id, MergeScope::Any).await.unwrap().unwrap();
        assert_eq!(reloaded.relationship, RELATIONSHIP_UNKNOWN);
        assert_eq!(reloaded.lineage_key(), head.id);
    }
}
