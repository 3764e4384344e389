//! PRIMARY / ALTERNATE collector role rows
//!
//! HEAD is not stored here; see `households.head_of_household_id`.

use hope_common::db::{CollectorRole, MergeScope, MergeStatus};
use hope_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{now_text, parse_uuid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub household_id: Uuid,
    pub individual_id: Uuid,
    pub role: CollectorRole,
    pub rdi_merge_status: MergeStatus,
}

impl RoleAssignment {
    pub fn new(
        household_id: Uuid,
        individual_id: Uuid,
        role: CollectorRole,
        status: MergeStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            household_id,
            individual_id,
            role,
            rdi_merge_status: status,
        }
    }
}

fn from_row(row: &SqliteRow) -> Result<RoleAssignment> {
    let id: String = row.get("id");
    let household_id: String = row.get("household_id");
    let individual_id: String = row.get("individual_id");
    let role: String = row.get("role");
    let status: String = row.get("rdi_merge_status");
    Ok(RoleAssignment {
        id: parse_uuid(&id)?,
        household_id: parse_uuid(&household_id)?,
        individual_id: parse_uuid(&individual_id)?,
        role: role.parse()?,
        rdi_merge_status: status.parse()?,
    })
}

pub async fn roles_of_household(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<RoleAssignment>> {
    let sql = format!(
        "SELECT id, household_id, individual_id, role, rdi_merge_status FROM roles WHERE \
         household_id = ? AND {} ORDER BY role",
        scope.predicate("rdi_merge_status")
    );
    let rows = sqlx::query(&sql)
        .bind(household_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(from_row).collect()
}

/// Every collector role an individual holds, any household
pub async fn roles_held_by(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
) -> Result<Vec<RoleAssignment>> {
    let rows = sqlx::query(
        r#"
        SELECT id, household_id, individual_id, role, rdi_merge_status FROM roles
        WHERE individual_id = ? AND rdi_merge_status <> 'REMOVED'
        ORDER BY household_id, role
        "#,
    )
    .bind(individual_id.to_string())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn find_role(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    role: CollectorRole,
) -> Result<Option<RoleAssignment>> {
    let row = sqlx::query(
        r#"
        SELECT id, household_id, individual_id, role, rdi_merge_status FROM roles
        WHERE household_id = ? AND role = ? AND rdi_merge_status <> 'REMOVED'
        "#,
    )
    .bind(household_id.to_string())
    .bind(role.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn insert_role(conn: &mut SqliteConnection, role: &RoleAssignment) -> Result<()> {
    sqlx::query(
        "INSERT INTO roles (id, household_id, individual_id, role, rdi_merge_status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(role.id.to_string())
    .bind(role.household_id.to_string())
    .bind(role.individual_id.to_string())
    .bind(role.role.as_str())
    .bind(role.rdi_merge_status.as_str())
    .bind(now_text())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn repoint_role(
    conn: &mut SqliteConnection,
    role_id: Uuid,
    new_individual_id: Uuid,
) -> Result<()> {
    sqlx::query("UPDATE roles SET individual_id = ? WHERE id = ?")
        .bind(new_individual_id.to_string())
        .bind(role_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_role(conn: &mut SqliteConnection, role_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM roles WHERE id = ?")
        .bind(role_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// PENDING → MERGED for all role rows of a household
pub async fn promote_household_roles(
    conn: &mut SqliteConnection,
    household_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE roles SET rdi_merge_status = 'MERGED' WHERE household_id = ? AND rdi_merge_status \
         = 'PENDING'",
    )
    .bind(household_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::households::{insert_household, Household};
    use crate::db::individuals::{insert_individual, Individual};
    use crate::db::programs::{insert_business_area, BusinessArea};
    use hope_common::db::open_in_memory;
    use hope_common::Error;

    #[tokio::test]
    async fn test_one_primary_per_household() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "yemen".into(),
            name: "Yemen".into(),
            postpone_deduplication: false,
        };
        insert_business_area(&mut conn, &area).await.unwrap();
        let household = Household::new("HH-1", area.id);
        insert_household(&mut conn, &household).await.unwrap();
        let a = Individual::new("IND-A", "A", area.id);
        let b = Individual::new("IND-B", "B", area.id);
        insert_individual(&mut conn, &a).await.unwrap();
        insert_individual(&mut conn, &b).await.unwrap();

        let primary =
            RoleAssignment::new(household.id, a.id, CollectorRole::Primary, MergeStatus::Pending);
        insert_role(&mut conn, &primary).await.unwrap();

        let second =
            RoleAssignment::new(household.id, b.id, CollectorRole::Primary, MergeStatus::Pending);
        let err = insert_role(&mut conn, &second).await.unwrap_err().classify();
        assert!(matches!(err, Error::DuplicateConstraint { .. }), "got {:?}", err);

        repoint_role(&mut conn, primary.id, b.id).await.unwrap();
        let found = find_role(&mut conn, household.id, CollectorRole::Primary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.individual_id, b.id);
        assert!(roles_held_by(&mut conn, a.id).await.unwrap().is_empty());

        assert_eq!(promote_household_roles(&mut conn, household.id).await.unwrap(), 1);
        assert_eq!(
            roles_of_household(&mut conn, household.id, MergeScope::Merged).await.unwrap().len(),
            1
        );
    }
}
