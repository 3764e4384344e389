//! Registration import merge
//!
//! IMPORTED (or MERGE_ERROR on retry) → MERGING → promote every household,
//! individual, role and satellite of the import from PENDING to MERGED →
//! deduplicate the merged documents → MERGED, or MERGE_ERROR when any record
//! could not be promoted or the run stopped early.
//!
//! Promotion is idempotent: a retried import only touches what is still
//! PENDING.

use hope_common::db::{ImportStatus, MergeScope};
use hope_common::{Error, Result};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::imports::{self, RegistrationImport};
use crate::db::{accounts, cards, documents, households, identities, individuals, roles};
use crate::services::batch_coordinator::{
    BatchCoordinator, BatchItem, BatchRunReport, Interruption, ItemHandler, ItemOutcome, Tally,
};
use crate::services::deduplication::{DedupScope, DeduplicationEngine, DeduplicationReport};
use crate::services::index_notifier::MutationSet;
use crate::utils::begin_monitored;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeItem {
    Household(Uuid),
    /// Individual outside any household of the import (external collector)
    Individual(Uuid),
}

impl BatchItem for MergeItem {
    fn key(&self) -> String {
        match self {
            MergeItem::Household(id) => format!("household:{}", id),
            MergeItem::Individual(id) => format!("individual:{}", id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeTally {
    pub households: usize,
    pub individuals: usize,
    pub satellites: u64,
}

impl Tally for MergeTally {
    fn absorb(&mut self, other: Self) {
        self.households += other.households;
        self.individuals += other.individuals;
        self.satellites += other.satellites;
    }
}

#[derive(Debug)]
pub struct ImportMergeReport {
    pub import_id: Uuid,
    pub status: ImportStatus,
    pub merge: BatchRunReport<MergeTally>,
    /// None when promotion stopped early
    pub deduplication: Option<BatchRunReport<DeduplicationReport>>,
}

/// Promote one individual and its satellites
async fn promote_individual(
    conn: &mut SqliteConnection,
    individual_id: Uuid,
    tally: &mut MergeTally,
) -> Result<()> {
    // Invalid account payloads keep the whole household pending
    accounts::validate_for_individual(conn, individual_id).await?;

    if individuals::promote_to_merged(conn, individual_id).await? {
        tally.individuals += 1;
    }
    tally.satellites += documents::promote_for_individual(conn, individual_id).await?;
    tally.satellites += identities::promote_for_individual(conn, individual_id).await?;
    tally.satellites += accounts::promote_for_individual(conn, individual_id).await?;
    Ok(())
}

struct MergeHandler;

impl ItemHandler for MergeHandler {
    type Item = MergeItem;
    type Tally = MergeTally;

    fn operation(&self) -> &'static str {
        "merge_import"
    }

    async fn handle(
        &self,
        conn: &mut SqliteConnection,
        item: &MergeItem,
    ) -> Result<ItemOutcome<MergeTally>> {
        let mut tally = MergeTally::default();
        let mut mutations = MutationSet::new();

        match *item {
            MergeItem::Household(household_id) => {
                let members =
                    individuals::load_members(conn, household_id, MergeScope::Pending).await?;
                for member in &members {
                    promote_individual(conn, member.id, &mut tally).await?;
                    mutations.add_individual(member.id);
                }
                if households::promote_to_merged(conn, household_id).await? {
                    tally.households += 1;
                }
                tally.satellites += roles::promote_household_roles(conn, household_id).await?;
                tally.satellites += cards::promote_for_household(conn, household_id).await?;
                mutations.add_household(household_id);
            }
            MergeItem::Individual(individual_id) => {
                promote_individual(conn, individual_id, &mut tally).await?;
                mutations.add_individual(individual_id);
            }
        }

        Ok(ItemOutcome::new(mutations, tally))
    }
}

pub struct ImportMerger<'a> {
    merge: &'a BatchCoordinator,
    dedup: &'a BatchCoordinator,
}

impl<'a> ImportMerger<'a> {
    /// `merge` batches promotion, `dedup` batches the deduplication run
    pub fn new(merge: &'a BatchCoordinator, dedup: &'a BatchCoordinator) -> Self {
        Self { merge, dedup }
    }

    pub async fn merge(&self, import_id: Uuid) -> Result<ImportMergeReport> {
        let import = self.start(import_id).await?;
        info!(import = %import.id, name = %import.name, "Import merge started");

        let (merge, deduplication) = match self.promote_and_deduplicate(&import).await {
            Ok(reports) => reports,
            Err(err) => {
                // Leave the import retryable rather than stuck in MERGING
                let message = format!("Merge stopped: {}", err);
                self.finish(import.id, ImportStatus::MergeError, Some(&message)).await?;
                warn!(import = %import.id, error = %err, "Import merge failed");
                return Err(err);
            }
        };

        let error_message = failure_message(&merge, deduplication.as_ref());
        let status = match error_message {
            None => ImportStatus::Merged,
            Some(_) => ImportStatus::MergeError,
        };
        self.finish(import.id, status, error_message.as_deref()).await?;

        if status == ImportStatus::Merged {
            info!(
                import = %import.id,
                households = merge.tally.households,
                individuals = merge.tally.individuals,
                "Import merged"
            );
        } else {
            warn!(import = %import.id, error = ?error_message, "Import merge failed");
        }

        Ok(ImportMergeReport {
            import_id: import.id,
            status,
            merge,
            deduplication,
        })
    }

    async fn promote_and_deduplicate(
        &self,
        import: &RegistrationImport,
    ) -> Result<(BatchRunReport<MergeTally>, Option<BatchRunReport<DeduplicationReport>>)> {
        let items = self.collect_items(import.id).await?;
        let merge = self.merge.run(&MergeHandler, &items, 0).await;
        if !merge.is_complete() {
            return Ok((merge, None));
        }

        let mut conn = self.merge.pool().acquire().await?;
        let pending = documents::pending_decision_for_import(&mut conn, import.id).await?;
        drop(conn);

        let scope = DedupScope {
            business_area_id: import.business_area_id,
            program_id: import.program_id,
        };
        let deduplication = DeduplicationEngine::new(self.dedup)
            .deduplicate(&pending, scope, 0)
            .await?;
        Ok((merge, Some(deduplication)))
    }

    /// IMPORTED | MERGE_ERROR → MERGING, committed before any batch
    async fn start(&self, import_id: Uuid) -> Result<RegistrationImport> {
        let mut tx = begin_monitored(self.merge.pool(), "merge_import_start").await?;
        let conn = tx.conn()?;
        let import = imports::load_import(conn, import_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Registration import {}", import_id)))?;

        let moved = imports::transition(
            conn,
            import_id,
            &[ImportStatus::Imported, ImportStatus::MergeError],
            ImportStatus::Merging,
            None,
        )
        .await?;
        if !moved {
            tx.rollback().await?;
            return Err(Error::Conflict(format!(
                "Registration import {} is {} and cannot be merged",
                import_id, import.status
            )));
        }
        tx.commit().await?;
        Ok(import)
    }

    async fn collect_items(&self, import_id: Uuid) -> Result<Vec<MergeItem>> {
        let mut conn = self.merge.pool().acquire().await?;
        let mut items: Vec<MergeItem> =
            households::ids_for_import(&mut conn, import_id, MergeScope::Pending)
                .await?
                .into_iter()
                .map(MergeItem::Household)
                .collect();
        items.extend(
            individuals::orphan_ids_for_import(&mut conn, import_id, MergeScope::Pending)
                .await?
                .into_iter()
                .map(MergeItem::Individual),
        );
        Ok(items)
    }

    async fn finish(
        &self,
        import_id: Uuid,
        status: ImportStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tx = begin_monitored(self.merge.pool(), "merge_import_finish").await?;
        imports::transition(tx.conn()?, import_id, &[ImportStatus::Merging], status, error_message)
            .await?;
        tx.commit().await
    }
}

fn failure_message(
    merge: &BatchRunReport<MergeTally>,
    deduplication: Option<&BatchRunReport<DeduplicationReport>>,
) -> Option<String> {
    if let Some(interruption) = &merge.interruption {
        return Some(match interruption {
            Interruption::Cancelled => "Merge cancelled".to_string(),
            Interruption::Failed(err) => format!("Merge stopped: {}", err),
        });
    }
    if let Some(first) = merge.failures.first() {
        return Some(format!(
            "{} of {} records not merged; first: {} {} {}",
            merge.failures.len(),
            merge.total,
            first.key,
            first.kind,
            first.message
        ));
    }
    match deduplication {
        Some(dedup) if !dedup.is_complete() => {
            Some("Deduplication stopped before completion".to_string())
        }
        Some(dedup) if !dedup.failures.is_empty() => Some(format!(
            "Deduplication failed for {} matching keys",
            dedup.failures.len()
        )),
        _ => None,
    }
}
