//! Closing needs-adjudication tickets
//!
//! The operator splits a ticket's individuals into distinct and duplicate.
//! Duplicates go through the removal state machine (roles handed over
//! first); distinct individuals get their documents back to VALID where the
//! key is not held by someone else.

use hope_common::db::{AdjudicationDecision, DocumentStatus, MergeScope, TicketStatus};
use hope_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{documents, tickets};
use crate::services::batch_coordinator::{
    BatchCoordinator, BatchItem, BatchRunReport, ItemHandler, ItemOutcome, Tally,
};
use crate::services::index_notifier::MutationSet;
use crate::services::role_reassignment::{self, Removal, ReassignmentEntry};

/// Operator decision for one ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjudicationRequest {
    pub ticket_id: Uuid,
    pub distinct: Vec<Uuid>,
    pub duplicates: Vec<Uuid>,
    #[serde(default)]
    pub reassignments: Vec<ReassignmentEntry>,
}

impl BatchItem for AdjudicationRequest {
    fn key(&self) -> String {
        self.ticket_id.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdjudicationTally {
    pub closed: usize,
    pub documents_restored: usize,
    /// Documents of distinct individuals whose key is still VALID elsewhere
    pub still_conflicting: Vec<Uuid>,
}

impl Tally for AdjudicationTally {
    fn absorb(&mut self, other: Self) {
        self.closed += other.closed;
        self.documents_restored += other.documents_restored;
        self.still_conflicting.extend(other.still_conflicting);
    }
}

/// Apply one decision and close the ticket
pub async fn close_adjudication(
    conn: &mut SqliteConnection,
    request: &AdjudicationRequest,
) -> Result<ItemOutcome<AdjudicationTally>> {
    let ticket = tickets::load_ticket(conn, request.ticket_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Ticket {}", request.ticket_id)))?;
    if ticket.status != TicketStatus::Open {
        return Err(Error::Conflict(format!("Ticket {} is already closed", ticket.id)));
    }

    let implicated: BTreeSet<Uuid> = ticket.implicated().into_iter().collect();
    let distinct: BTreeSet<Uuid> = request.distinct.iter().copied().collect();
    let duplicates: BTreeSet<Uuid> = request.duplicates.iter().copied().collect();
    if distinct.is_empty() {
        return Err(Error::InvalidInput(format!(
            "Ticket {}: at least one individual must be distinct",
            ticket.id
        )));
    }
    if !distinct.is_disjoint(&duplicates) {
        return Err(Error::InvalidInput(format!(
            "Ticket {}: an individual cannot be both distinct and duplicate",
            ticket.id
        )));
    }
    let decided: BTreeSet<Uuid> = distinct.union(&duplicates).copied().collect();
    if decided != implicated {
        return Err(Error::InvalidInput(format!(
            "Ticket {}: decisions must cover exactly the {} implicated individuals",
            ticket.id,
            implicated.len()
        )));
    }

    let unique_id = if distinct.contains(&ticket.golden_record_individual_id) {
        ticket.golden_record_individual_id
    } else {
        request.distinct[0]
    };

    let mut mutations = MutationSet::new();
    for id in &request.duplicates {
        tickets::record_decision(conn, ticket.id, *id, AdjudicationDecision::Duplicate).await?;
        let removed = role_reassignment::remove_individual(
            conn,
            *id,
            Removal::DuplicateOf(unique_id),
            &request.reassignments,
        )
        .await?;
        mutations.merge(removed);
    }

    let mut tally = AdjudicationTally::default();
    for id in &request.distinct {
        tickets::record_decision(conn, ticket.id, *id, AdjudicationDecision::Distinct).await?;
        for doc in documents::documents_of_individual(conn, *id, MergeScope::Merged).await? {
            if doc.status != DocumentStatus::NeedInvestigation {
                continue;
            }
            if let Some(key) = &ticket.matching_key {
                if doc.matching_key().to_string() != *key {
                    continue;
                }
            }
            if documents::restore_valid(conn, doc.id).await? {
                tally.documents_restored += 1;
            } else {
                warn!(
                    ticket = %ticket.id,
                    document = %doc.id,
                    individual = %id,
                    "Document key still held, left for investigation"
                );
                tally.still_conflicting.push(doc.id);
            }
        }
        mutations.add_individual(*id);
    }

    tickets::close_ticket(conn, ticket.id).await?;
    tally.closed = 1;
    info!(
        ticket = %ticket.id,
        distinct = distinct.len(),
        duplicates = duplicates.len(),
        unique = %unique_id,
        still_conflicting = tally.still_conflicting.len(),
        "Adjudication closed"
    );

    Ok(ItemOutcome::new(mutations, tally))
}

struct AdjudicationHandler;

impl ItemHandler for AdjudicationHandler {
    type Item = AdjudicationRequest;
    type Tally = AdjudicationTally;

    fn operation(&self) -> &'static str {
        "close_adjudication"
    }

    async fn handle(
        &self,
        conn: &mut SqliteConnection,
        item: &AdjudicationRequest,
    ) -> Result<ItemOutcome<AdjudicationTally>> {
        close_adjudication(conn, item).await
    }
}

/// Close several tickets; each one commits or fails on its own
pub async fn close_tickets(
    coordinator: &BatchCoordinator,
    requests: &[AdjudicationRequest],
    start: usize,
) -> BatchRunReport<AdjudicationTally> {
    coordinator.run(&AdjudicationHandler, requests, start).await
}
