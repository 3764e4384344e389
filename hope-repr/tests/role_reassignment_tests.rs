//! Role hand-over when a duplicate or withdrawn individual leaves
//!
//! - A duplicate holding HEAD and PRIMARY blocks the ticket until both are
//!   reassigned
//! - Reassignments arrive as JSON, as the command line supplies them
//! - Withdrawing the last active member withdraws the household

mod helpers;

use hope_common::db::{
    CollectorRole, HouseholdRole, MergeScope, MergeStatus, TicketStatus, RELATIONSHIP_HEAD,
};
use hope_repr::db::{documents, households, individuals, roles, tickets};
use hope_repr::services::adjudication::{close_tickets, AdjudicationRequest};
use hope_repr::services::deduplication::{DedupScope, DeduplicationEngine};
use hope_repr::services::role_reassignment::{self, ReassignmentEntry};

use helpers::*;

#[tokio::test]
async fn test_duplicate_head_and_primary_needs_both_reassignments() {
    let db = test_db().await;
    let mut conn = db.pool.acquire().await.unwrap();
    let area = business_area(&mut conn, "afghanistan", false).await;

    // X registered first elsewhere; A heads H and collects for it
    let x = individual(&mut conn, area, None, "X", MergeStatus::Merged, at(0)).await;
    let h = household(&mut conn, area, "HH-7", MergeStatus::Merged).await;
    let a = individual(&mut conn, area, Some(h), "A", MergeStatus::Merged, at(5)).await;
    let b = individual(&mut conn, area, Some(h), "B", MergeStatus::Merged, at(6)).await;
    make_head(&mut conn, h, a).await;
    role(&mut conn, h, a, CollectorRole::Primary).await;
    national_id(&mut conn, x, "AB123", MergeStatus::Merged, at(10)).await;
    national_id(&mut conn, a, "AB123", MergeStatus::Merged, at(11)).await;
    let pending = documents::pending_decision_in_area(&mut conn, area, None).await.unwrap();
    drop(conn);

    let coordinator = coordinator(&db.pool, 10);
    let scope = DedupScope {
        business_area_id: area,
        program_id: None,
    };
    DeduplicationEngine::new(&coordinator).deduplicate(&pending, scope, 0).await.unwrap();

    let mut conn = db.pool.acquire().await.unwrap();
    let ticket = tickets::open_tickets_touching(&mut conn, &[a]).await.unwrap().remove(0);
    assert_eq!(ticket.golden_record_individual_id, x);
    drop(conn);

    let decide = |reassignments: Vec<ReassignmentEntry>| AdjudicationRequest {
        ticket_id: ticket.id,
        distinct: vec![x],
        duplicates: vec![a],
        reassignments,
    };

    let bare = close_tickets(&coordinator, &[decide(Vec::new())], 0).await;
    assert_eq!(bare.failures.len(), 1);
    assert_eq!(bare.failures[0].kind, "CONFLICT");

    let head_only = close_tickets(
        &coordinator,
        &[decide(vec![ReassignmentEntry::new(HouseholdRole::Head, h, a, b)])],
        0,
    )
    .await;
    assert_eq!(head_only.failures.len(), 1, "PRIMARY gap still open");

    let mut conn = db.pool.acquire().await.unwrap();
    let untouched = households::load_household(&mut conn, h, MergeScope::Merged)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.head_of_household_id, Some(a), "failed attempts roll back");
    assert_eq!(
        tickets::load_ticket(&mut conn, ticket.id).await.unwrap().unwrap().status,
        TicketStatus::Open
    );
    drop(conn);

    let json = format!(
        r#"[
            {{"role": "HEAD", "household_id": "{h}",
              "outgoing_individual_id": "{a}", "new_individual_id": "{b}"}},
            {{"role": "PRIMARY", "household_id": "{h}",
              "outgoing_individual_id": "{a}", "new_individual_id": "{b}"}}
        ]"#
    );
    let both: Vec<ReassignmentEntry> = serde_json::from_str(&json).unwrap();
    let report = close_tickets(&coordinator, &[decide(both)], 0).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.tally.closed, 1);

    let mut conn = db.pool.acquire().await.unwrap();
    let household = households::load_household(&mut conn, h, MergeScope::Merged)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(household.head_of_household_id, Some(b));
    let new_head = individuals::load_individual(&mut conn, b, MergeScope::Merged)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_head.relationship, RELATIONSHIP_HEAD);
    let primary = roles::find_role(&mut conn, h, CollectorRole::Primary).await.unwrap().unwrap();
    assert_eq!(primary.individual_id, b);

    let duplicate = individuals::load_individual(&mut conn, a, MergeScope::Merged)
        .await
        .unwrap()
        .unwrap();
    assert!(duplicate.duplicate);
    assert_eq!(duplicate.unique_individual_id, Some(x));
    assert!(roles::roles_held_by(&mut conn, a).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_withdrawing_last_member_withdraws_household() {
    let db = test_db().await;
    let mut tx = db.pool.begin().await.unwrap();
    let area = business_area(&mut tx, "kenya", false).await;
    let h = household(&mut tx, area, "HH-9", MergeStatus::Merged).await;
    let a = individual(&mut tx, area, Some(h), "A", MergeStatus::Merged, at(0)).await;
    make_head(&mut tx, h, a).await;
    role(&mut tx, h, a, CollectorRole::Primary).await;

    // Sole member: neither HEAD nor PRIMARY needs a successor
    role_reassignment::withdraw_individual(&mut tx, a, &[]).await.unwrap();
    tx.commit().await.unwrap();

    let mut conn = db.pool.acquire().await.unwrap();
    let household = households::load_household(&mut conn, h, MergeScope::Merged)
        .await
        .unwrap()
        .unwrap();
    assert!(household.withdrawn);
    assert_eq!(role_reassignment::household_active_member_count(&mut conn, h).await.unwrap(), 0);
    assert!(roles::roles_of_household(&mut conn, h, MergeScope::Any).await.unwrap().is_empty());
}
