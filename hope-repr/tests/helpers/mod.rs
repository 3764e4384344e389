//! Shared fixtures for hope-repr integration tests
//!
//! Every test gets its own database file under a temp dir, created through
//! the same initialization path as the binary.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use hope_common::db::{init_database, CollectorRole, DocumentStatus, MergeStatus, RELATIONSHIP_HEAD};
use hope_repr::db::documents::{self, Document, MatchingKey};
use hope_repr::db::households::{self, Household};
use hope_repr::db::individuals::{self, Individual};
use hope_repr::db::programs::{self, BusinessArea, DocumentType, Program};
use hope_repr::db::roles::{self, RoleAssignment};
use hope_repr::services::{BatchCoordinator, NoopNotifier};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

pub struct TestDb {
    // Keeps the database file alive for the test
    _dir: TempDir,
    pub pool: SqlitePool,
}

pub async fn test_db() -> TestDb {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("hope.db")).await.unwrap();
    TestDb { _dir: dir, pool }
}

pub fn coordinator(pool: &SqlitePool, batch_size: usize) -> BatchCoordinator {
    BatchCoordinator::new(pool.clone(), Arc::new(NoopNotifier), batch_size)
}

/// Fixed reference instant; fixtures offset from it so ordering never
/// depends on clock resolution
pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::seconds(seconds)
}

pub async fn business_area(
    conn: &mut SqliteConnection,
    slug: &str,
    postpone_deduplication: bool,
) -> Uuid {
    let area = BusinessArea {
        id: Uuid::new_v4(),
        slug: slug.into(),
        name: slug.to_uppercase(),
        postpone_deduplication,
    };
    programs::insert_business_area(conn, &area).await.unwrap();
    programs::upsert_document_type(
        conn,
        &DocumentType {
            key: "national_id".into(),
            label: "National ID".into(),
            valid_for_deduplication: true,
        },
    )
    .await
    .unwrap();
    programs::upsert_document_type(
        conn,
        &DocumentType {
            key: "birth_certificate".into(),
            label: "Birth Certificate".into(),
            valid_for_deduplication: false,
        },
    )
    .await
    .unwrap();
    area.id
}

pub async fn program(conn: &mut SqliteConnection, area: Uuid, name: &str) -> Uuid {
    let program = Program {
        id: Uuid::new_v4(),
        business_area_id: area,
        name: name.into(),
        status: "ACTIVE".into(),
    };
    programs::insert_program(conn, &program).await.unwrap();
    program.id
}

pub async fn household(
    conn: &mut SqliteConnection,
    area: Uuid,
    unicef_id: &str,
    status: MergeStatus,
) -> Uuid {
    let mut household = Household::new(unicef_id, area);
    household.rdi_merge_status = status;
    households::insert_household(conn, &household).await.unwrap();
    household.id
}

pub async fn individual(
    conn: &mut SqliteConnection,
    area: Uuid,
    household_id: Option<Uuid>,
    name: &str,
    status: MergeStatus,
    created_at: DateTime<Utc>,
) -> Uuid {
    let mut ind = Individual::new(format!("IND-{}", name), name, area);
    ind.household_id = household_id;
    ind.rdi_merge_status = status;
    ind.created_at = created_at;
    individuals::insert_individual(conn, &ind).await.unwrap();
    ind.id
}

pub async fn make_head(conn: &mut SqliteConnection, household_id: Uuid, individual_id: Uuid) {
    individuals::set_relationship(conn, individual_id, RELATIONSHIP_HEAD).await.unwrap();
    households::set_head(conn, household_id, Some(individual_id)).await.unwrap();
}

pub async fn role(
    conn: &mut SqliteConnection,
    household_id: Uuid,
    individual_id: Uuid,
    role: CollectorRole,
) {
    let assignment = RoleAssignment::new(household_id, individual_id, role, MergeStatus::Merged);
    roles::insert_role(conn, &assignment).await.unwrap();
}

pub async fn national_id(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    number: &str,
    status: MergeStatus,
    created_at: DateTime<Utc>,
) -> Uuid {
    let key = MatchingKey::new(number, "national_id", "AFG");
    let mut doc = Document::new(individual_id, None, &key);
    doc.rdi_merge_status = status;
    doc.created_at = created_at;
    documents::insert_document(conn, &doc).await.unwrap();
    doc.id
}

pub async fn document_status(conn: &mut SqliteConnection, id: Uuid) -> DocumentStatus {
    documents::load_document(conn, id).await.unwrap().unwrap().status
}
