//! Document deduplication by matching key
//!
//! Documents are grouped by (number, type, country). Per group and scope:
//!
//! 1. Per individual row, keep the earliest document and invalidate the rest.
//! 2. Kept documents of one lineage (one real person, possibly represented
//!    in several programs) are VALID.
//! 3. Kept documents spanning several lineages need investigation; one
//!    needs-adjudication ticket is created, or the open ticket of the same
//!    key touching those individuals is reused.
//!
//! Types not flagged for deduplication become VALID without a lookup.

use hope_common::db::DocumentStatus;
use hope_common::{Error, Result};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::documents::{self, Document, DocumentMatch, MatchingKey};
use crate::db::programs;
use crate::db::tickets::{self, Ticket};
use crate::services::batch_coordinator::{
    BatchCoordinator, BatchItem, BatchRunReport, ItemHandler, ItemOutcome, Tally,
};
use crate::services::index_notifier::MutationSet;

/// Where duplicates are looked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupScope {
    pub business_area_id: Uuid,
    /// None: the whole business area
    pub program_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeduplicationReport {
    pub valid: usize,
    pub needs_investigation: usize,
    pub invalid: usize,
    pub tickets_created: usize,
    pub tickets_reused: usize,
    /// Deduplication is deferred for the business area; nothing was touched
    pub postponed: bool,
}

impl Tally for DeduplicationReport {
    fn absorb(&mut self, other: Self) {
        self.valid += other.valid;
        self.needs_investigation += other.needs_investigation;
        self.invalid += other.invalid;
        self.tickets_created += other.tickets_created;
        self.tickets_reused += other.tickets_reused;
        self.postponed |= other.postponed;
    }
}

/// One unit of deduplication work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupItem {
    /// A matching key to evaluate against the store
    Key(MatchingKey),
    /// Documents of types that do not take part in deduplication
    Exempt(Vec<Uuid>),
}

impl BatchItem for DedupItem {
    fn key(&self) -> String {
        match self {
            DedupItem::Key(key) => key.to_string(),
            DedupItem::Exempt(ids) => format!("exempt({} documents)", ids.len()),
        }
    }
}

/// Partition undecided documents into work items: one per distinct
/// matching key, plus one for exempt types
pub fn plan(documents: &[Document], dedup_types: &HashSet<String>) -> Vec<DedupItem> {
    let mut keys = BTreeSet::new();
    let mut exempt = Vec::new();
    for doc in documents.iter().filter(|d| d.status == DocumentStatus::Pending) {
        if dedup_types.contains(&doc.type_key) {
            keys.insert(doc.matching_key());
        } else {
            exempt.push(doc.id);
        }
    }

    let mut items: Vec<DedupItem> = keys.into_iter().map(DedupItem::Key).collect();
    if !exempt.is_empty() {
        items.push(DedupItem::Exempt(exempt));
    }
    items
}

/// Evaluate one matching key within `scope`
pub async fn deduplicate_key(
    conn: &mut SqliteConnection,
    key: &MatchingKey,
    scope: DedupScope,
) -> Result<ItemOutcome<DeduplicationReport>> {
    let window =
        documents::load_matching(conn, key, scope.business_area_id, scope.program_id).await?;
    let mut report = DeduplicationReport::default();
    let mut mutations = MutationSet::new();
    if window.is_empty() {
        return Ok(ItemOutcome::new(mutations, report));
    }
    mutations.add_individuals(window.iter().map(|m| m.document.individual_id));

    // Window is ordered by creation: first document per owner is kept
    let mut owners = HashSet::new();
    let mut kept: Vec<&DocumentMatch> = Vec::new();
    let mut invalid = Vec::new();
    for candidate in &window {
        if owners.insert(candidate.document.individual_id) {
            kept.push(candidate);
        } else {
            invalid.push(candidate.document.id);
        }
    }
    if !invalid.is_empty() {
        documents::set_status(conn, &invalid, DocumentStatus::Invalid).await?;
        report.invalid = invalid.len();
        debug!(
            key = %key,
            invalidated = invalid.len(),
            "Repeated documents of one individual invalidated"
        );
    }

    // Representative per lineage: its earliest individual row
    let mut lineages: BTreeMap<Uuid, &DocumentMatch> = BTreeMap::new();
    for candidate in &kept {
        let entry = lineages.entry(candidate.lineage_key()).or_insert(*candidate);
        if owner_order(candidate) < owner_order(entry) {
            *entry = *candidate;
        }
    }

    let kept_ids: Vec<Uuid> = kept.iter().map(|m| m.document.id).collect();
    if lineages.len() == 1 {
        documents::set_status(conn, &kept_ids, DocumentStatus::Valid).await?;
        report.valid = kept_ids.len();
        return Ok(ItemOutcome::new(mutations, report));
    }

    documents::set_status(conn, &kept_ids, DocumentStatus::NeedInvestigation).await?;
    report.needs_investigation = kept_ids.len();

    let mut representatives: Vec<&DocumentMatch> = lineages.into_values().collect();
    representatives.sort_by_key(|m| owner_order(m));
    let implicated: Vec<Uuid> = representatives.iter().map(|m| m.document.individual_id).collect();

    if reuse_ticket(conn, key, &implicated).await? {
        report.tickets_reused = 1;
    } else {
        let ticket = Ticket {
            id: Uuid::new_v4(),
            status: hope_common::db::TicketStatus::Open,
            business_area_id: scope.business_area_id,
            program_id: scope.program_id,
            golden_record_individual_id: implicated[0],
            possible_duplicates: implicated[1..].to_vec(),
            matching_key: Some(key.to_string()),
            created_at: chrono::Utc::now(),
            closed_at: None,
        };
        tickets::insert_ticket(conn, &ticket).await?;
        report.tickets_created = 1;
        info!(
            key = %key,
            ticket = %ticket.id,
            golden_record = %ticket.golden_record_individual_id,
            possible_duplicates = ticket.possible_duplicates.len(),
            "Needs-adjudication ticket created"
        );
    }

    Ok(ItemOutcome::new(mutations, report))
}

/// Golden-record order: earliest individual, then lowest id
fn owner_order(candidate: &DocumentMatch) -> (chrono::DateTime<chrono::Utc>, Uuid) {
    (candidate.owner_created_at, candidate.document.individual_id)
}

/// Extend the open ticket raised by this key that already touches any of
/// `implicated`. Tickets of other keys are never extended: closing a ticket
/// only settles documents of its own key.
async fn reuse_ticket(
    conn: &mut SqliteConnection,
    key: &MatchingKey,
    implicated: &[Uuid],
) -> Result<bool> {
    let open = tickets::open_tickets_touching(conn, implicated).await?;
    let key_text = key.to_string();
    let ticket = match open.iter().find(|t| t.matching_key.as_deref() == Some(key_text.as_str())) {
        Some(ticket) => ticket,
        None => return Ok(false),
    };

    let listed: HashSet<Uuid> = ticket.implicated().into_iter().collect();
    let mut added = 0;
    for id in implicated.iter().filter(|id| !listed.contains(id)) {
        if tickets::add_possible_duplicate(conn, ticket.id, *id).await? {
            added += 1;
        }
    }
    debug!(key = %key, ticket = %ticket.id, added, "Open ticket reused");
    Ok(true)
}

/// Exempt documents become VALID
pub async fn mark_exempt(
    conn: &mut SqliteConnection,
    ids: &[Uuid],
) -> Result<ItemOutcome<DeduplicationReport>> {
    let updated = documents::set_status(conn, ids, DocumentStatus::Valid).await?;
    let report = DeduplicationReport {
        valid: updated as usize,
        ..Default::default()
    };
    Ok(ItemOutcome::new(MutationSet::new(), report))
}

struct DedupHandler {
    scope: DedupScope,
}

impl ItemHandler for DedupHandler {
    type Item = DedupItem;
    type Tally = DeduplicationReport;

    fn operation(&self) -> &'static str {
        "deduplicate"
    }

    async fn handle(
        &self,
        conn: &mut SqliteConnection,
        item: &DedupItem,
    ) -> Result<ItemOutcome<DeduplicationReport>> {
        match item {
            DedupItem::Key(key) => deduplicate_key(conn, key, self.scope).await,
            DedupItem::Exempt(ids) => mark_exempt(conn, ids).await,
        }
    }
}

/// Runs deduplication over document batches through the coordinator
pub struct DeduplicationEngine<'a> {
    coordinator: &'a BatchCoordinator,
}

impl<'a> DeduplicationEngine<'a> {
    pub fn new(coordinator: &'a BatchCoordinator) -> Self {
        Self { coordinator }
    }

    /// Deduplicate `documents` (undecided, merged) within `scope`, starting
    /// at work item `start`
    pub async fn deduplicate(
        &self,
        documents: &[Document],
        scope: DedupScope,
        start: usize,
    ) -> Result<BatchRunReport<DeduplicationReport>> {
        let mut conn = self.coordinator.pool().acquire().await?;
        let area = programs::load_business_area(&mut conn, scope.business_area_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Business area {}", scope.business_area_id)))?;

        if area.postpone_deduplication {
            info!(
                business_area = %area.slug,
                documents = documents.len(),
                "Deduplication postponed"
            );
            let mut report: BatchRunReport<DeduplicationReport> =
                BatchRunReport::new("deduplicate", 0);
            report.tally.postponed = true;
            return Ok(report);
        }

        let dedup_types = programs::dedup_document_types(&mut conn).await?;
        drop(conn);

        let items = plan(documents, &dedup_types);
        debug!(documents = documents.len(), items = items.len(), "Deduplication planned");
        Ok(self.coordinator.run(&DedupHandler { scope }, &items, start).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::individuals::{insert_individual, Individual};
    use crate::db::programs::{
        insert_business_area, upsert_document_type, BusinessArea, DocumentType,
    };
    use crate::services::index_notifier::NoopNotifier;
    use hope_common::db::{open_in_memory, MergeScope, MergeStatus, TicketStatus};
    use sqlx::SqlitePool;
    use std::sync::Arc;

    async fn setup(pool: &SqlitePool, postpone: bool) -> DedupScope {
        let mut conn = pool.acquire().await.unwrap();
        let area = BusinessArea {
            id: Uuid::new_v4(),
            slug: "afg".into(),
            name: "Afghanistan".into(),
            postpone_deduplication: postpone,
        };
        insert_business_area(&mut conn, &area).await.unwrap();
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
        DedupScope {
            business_area_id: area.id,
            program_id: None,
        }
    }

    async fn person(conn: &mut SqliteConnection, scope: DedupScope, name: &str) -> Uuid {
        let mut ind = Individual::new(format!("IND-{}", name), name, scope.business_area_id);
        ind.rdi_merge_status = MergeStatus::Merged;
        insert_individual(conn, &ind).await.unwrap();
        ind.id
    }

    async fn document(
        conn: &mut SqliteConnection,
        owner: Uuid,
        number: &str,
        type_key: &str,
    ) -> Document {
        let mut doc = Document::new(owner, None, &MatchingKey::new(number, type_key, "AFG"));
        doc.rdi_merge_status = MergeStatus::Merged;
        documents::insert_document(conn, &doc).await.unwrap();
        doc
    }

    async fn status(conn: &mut SqliteConnection, id: Uuid) -> DocumentStatus {
        documents::load_document(conn, id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_unique_key_becomes_valid() {
        let pool = open_in_memory().await.unwrap();
        let scope = setup(&pool, false).await;
        let mut conn = pool.acquire().await.unwrap();
        let x = person(&mut conn, scope, "X").await;
        let doc = document(&mut conn, x, "AB123", "national_id").await;

        let outcome = deduplicate_key(&mut conn, &doc.matching_key(), scope).await.unwrap();
        assert_eq!(outcome.tally.valid, 1);
        assert_eq!(status(&mut conn, doc.id).await, DocumentStatus::Valid);
    }

    #[tokio::test]
    async fn test_two_people_one_key_raise_one_ticket() {
        let pool = open_in_memory().await.unwrap();
        let scope = setup(&pool, false).await;
        let mut conn = pool.acquire().await.unwrap();
        let x = person(&mut conn, scope, "X").await;
        let y = person(&mut conn, scope, "Y").await;
        let dx = document(&mut conn, x, "AB123", "national_id").await;
        let dy = document(&mut conn, y, "AB123", "national_id").await;
        let key = dx.matching_key();

        let first = deduplicate_key(&mut conn, &key, scope).await.unwrap().tally;
        assert_eq!(first.needs_investigation, 2);
        assert_eq!(first.tickets_created, 1);
        assert_eq!(status(&mut conn, dy.id).await, DocumentStatus::NeedInvestigation);

        let again = deduplicate_key(&mut conn, &key, scope).await.unwrap().tally;
        assert_eq!(again.tickets_created, 0);
        assert_eq!(again.tickets_reused, 1);

        let tickets = tickets::open_tickets_touching(&mut conn, &[x, y]).await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].golden_record_individual_id, x);
        assert_eq!(tickets[0].possible_duplicates, vec![y]);
        assert_eq!(tickets[0].status, TicketStatus::Open);
        assert_eq!(tickets[0].matching_key.as_deref(), Some("AB123|national_id|AFG"));

        // Third document with the same key for X
        let dx2 = document(&mut conn, x, "AB123", "national_id").await;
        let third = deduplicate_key(&mut conn, &key, scope).await.unwrap().tally;
        assert_eq!(third.invalid, 1);
        assert_eq!(status(&mut conn, dx2.id).await, DocumentStatus::Invalid);
        assert_eq!(tickets::count_for_individual(&mut conn, x).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_lineage_is_not_a_duplicate() {
        let pool = open_in_memory().await.unwrap();
        let scope = setup(&pool, false).await;
        let mut conn = pool.acquire().await.unwrap();

        let collection = crate::db::collections::insert_collection(
            &mut conn,
            hope_common::db::EntityKind::Individual,
        )
        .await
        .unwrap();
        let mut origin = Individual::new("IND-X", "X", scope.business_area_id);
        origin.rdi_merge_status = MergeStatus::Merged;
        origin.collection_id = Some(collection);
        insert_individual(&mut conn, &origin).await.unwrap();
        let mut copy = origin.clone();
        copy.id = Uuid::new_v4();
        copy.copied_from_id = Some(origin.id);
        insert_individual(&mut conn, &copy).await.unwrap();

        let a = document(&mut conn, origin.id, "AB123", "national_id").await;
        let b = document(&mut conn, copy.id, "AB123", "national_id").await;

        let report = deduplicate_key(&mut conn, &a.matching_key(), scope).await.unwrap().tally;
        assert_eq!(report.valid, 2);
        assert_eq!(report.tickets_created, 0);
        assert_eq!(status(&mut conn, b.id).await, DocumentStatus::Valid);
    }

    #[tokio::test]
    async fn test_engine_plans_keys_and_exempt_types() {
        let pool = open_in_memory().await.unwrap();
        let scope = setup(&pool, false).await;
        let mut conn = pool.acquire().await.unwrap();
        let x = person(&mut conn, scope, "X").await;
        let y = person(&mut conn, scope, "Y").await;
        let docs = vec![
            document(&mut conn, x, "AB123", "national_id").await,
            document(&mut conn, y, "AB123", "national_id").await,
            document(&mut conn, y, "BC-9", "birth_certificate").await,
            document(&mut conn, x, "BC-9", "birth_certificate").await,
        ];
        drop(conn);

        let items = plan(&docs, &["national_id".to_string()].into_iter().collect());
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], DedupItem::Exempt(ids) if ids.len() == 2));

        let coordinator = BatchCoordinator::new(pool.clone(), Arc::new(NoopNotifier), 10);
        let report = DeduplicationEngine::new(&coordinator)
            .deduplicate(&docs, scope, 0)
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.tally.valid, 2);
        assert_eq!(report.tally.needs_investigation, 2);
        assert_eq!(report.tally.tickets_created, 1);

        let mut conn = pool.acquire().await.unwrap();
        let owned = documents::documents_of_individual(&mut conn, x, MergeScope::Any)
            .await
            .unwrap();
        assert!(owned.iter().any(|d| d.status == DocumentStatus::Valid));
    }

    #[tokio::test]
    async fn test_postponed_area_leaves_documents_pending() {
        let pool = open_in_memory().await.unwrap();
        let scope = setup(&pool, true).await;
        let mut conn = pool.acquire().await.unwrap();
        let x = person(&mut conn, scope, "X").await;
        let doc = document(&mut conn, x, "AB123", "national_id").await;
        drop(conn);

        let coordinator = BatchCoordinator::new(pool.clone(), Arc::new(NoopNotifier), 10);
        let report = DeduplicationEngine::new(&coordinator)
            .deduplicate(&[doc.clone()], scope, 0)
            .await
            .unwrap();
        assert!(report.tally.postponed);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(status(&mut conn, doc.id).await, DocumentStatus::Pending);
    }
}
