//! Financial accounts
//!
//! Rows are read raw and validated into [`AccountDetails`] by the caller
//! that needs them typed; an invalid stored payload is reported, not skipped.

use hope_common::db::{MergeScope, MergeStatus};
use hope_common::{Error, Result};
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use super::{now_text, parse_opt_uuid, parse_uuid};
use crate::models::{AccountDetails, AccountKind};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAccount {
    pub id: Uuid,
    pub individual_id: Uuid,
    pub kind: String,
    pub data: Value,
    pub copied_from_id: Option<Uuid>,
    pub rdi_merge_status: MergeStatus,
}

impl StoredAccount {
    /// Validate against the capability table
    pub fn details(&self) -> Result<AccountDetails> {
        self.kind
            .parse::<AccountKind>()
            .and_then(|kind| AccountDetails::from_fields(kind, &self.data))
            .map_err(|e| Error::Conflict(format!("Financial account {}: {}", self.id, e)))
    }
}

pub async fn insert_account(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    details: &AccountDetails,
    merge_status: MergeStatus,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let data = details.to_fields()?;
    sqlx::query(
        "INSERT INTO financial_accounts (id, individual_id, kind, data, rdi_merge_status, \
         created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(individual_id.to_string())
    .bind(details.kind().as_str())
    .bind(data.to_string())
    .bind(merge_status.as_str())
    .bind(now_text())
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn accounts_of_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    scope: MergeScope,
) -> Result<Vec<StoredAccount>> {
    let sql = format!(
        "SELECT id, individual_id, kind, data, copied_from_id, rdi_merge_status \
         FROM financial_accounts WHERE individual_id = ? AND {} ORDER BY created_at, id",
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
            let raw: String = row.get("data");
            let status: String = row.get("rdi_merge_status");
            let id = parse_uuid(&id)?;
            let data = serde_json::from_str(&raw).map_err(|e| {
                Error::Conflict(format!("Financial account {}: unreadable data: {}", id, e))
            })?;
            Ok(StoredAccount {
                id,
                individual_id: parse_uuid(&individual_id)?,
                kind: row.get("kind"),
                data,
                copied_from_id: parse_opt_uuid(row.get("copied_from_id"))?,
                rdi_merge_status: status.parse()?,
            })
        })
        .collect()
}

/// Validate every account of the individual; first failure wins
pub async fn validate_for_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
) -> Result<usize> {
    let accounts = accounts_of_individual(conn, individual_id, MergeScope::Any).await?;
    for account in &accounts {
        account.details()?;
    }
    Ok(accounts.len())
}

/// Validate and copy every account onto a new owner
pub async fn copy_accounts(
    conn: &mut SqliteConnection,
    source_individual_id: Uuid,
    new_individual_id: Uuid,
    merge_status: MergeStatus,
) -> Result<usize> {
    let sources = accounts_of_individual(conn, source_individual_id, MergeScope::Any).await?;
    if sources.is_empty() {
        return Ok(0);
    }

    let mut rows = Vec::with_capacity(sources.len());
    for account in &sources {
        let details = account.details()?;
        rows.push((account.id, details.kind(), details.to_fields()?));
    }

    let created_at = now_text();
    let mut builder = QueryBuilder::<Sqlite>::new(
        "INSERT INTO financial_accounts (id, individual_id, kind, data, copied_from_id, \
         rdi_merge_status, created_at) ",
    );
    builder.push_values(&rows, |mut b, (source_id, kind, data)| {
        b.push_bind(Uuid::new_v4().to_string())
            .push_bind(new_individual_id.to_string())
            .push_bind(kind.as_str())
            .push_bind(data.to_string())
            .push_bind(source_id.to_string())
            .push_bind(merge_status.as_str())
            .push_bind(created_at.clone());
    });
    builder.build().execute(&mut *conn).await?;

    Ok(rows.len())
}

pub async fn promote_for_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE financial_accounts SET rdi_merge_status = 'MERGED' WHERE individual_id = ? AND \
         rdi_merge_status = 'PENDING'",
    )
    .bind(individual_id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::individuals::{insert_individual, Individual};
    use crate::db::programs::{insert_business_area, BusinessArea};
    use hope_common::db::open_in_memory;

    #[tokio::test]
    async fn test_invalid_stored_account_is_conflict() {
        let pool = open_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "kenya".into(),
            name: "Kenya".into(),
            postpone_deduplication: false,
        };
        insert_business_area(&mut conn, &area).await.unwrap();
        let owner = Individual::new("IND-1", "Wanjiru", area.id);
        insert_individual(&mut conn, &owner).await.unwrap();
        let target = Individual::new("IND-1", "Wanjiru", area.id);
        insert_individual(&mut conn, &target).await.unwrap();

        let wallet = AccountDetails::MobileMoney {
            provider: "M-Pesa".into(),
            phone_number: "+254700000001".into(),
            account_holder_name: None,
        };
        insert_account(&mut conn, owner.id, &wallet, MergeStatus::Merged).await.unwrap();
        assert_eq!(
            copy_accounts(&mut conn, owner.id, target.id, MergeStatus::Merged).await.unwrap(),
            1
        );
        let copied = accounts_of_individual(&mut conn, target.id, MergeScope::Merged)
            .await
            .unwrap();
        assert_eq!(copied[0].details().unwrap(), wallet);

        sqlx::query(
            "INSERT INTO financial_accounts (id, individual_id, kind, data, created_at) VALUES (?, \
             ?, 'bank_transfer', '{\"bank_name\":\"KCB\"}', '2024-01-01T00:00:00.000000Z')",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner.id.to_string())
        .execute(&mut *conn)
        .await
        .unwrap();
        let err = validate_for_individual(&mut conn, owner.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "got {:?}", err);
    }
}
