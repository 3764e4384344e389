//! Program enrollment: representations of existing households and
//! individuals in a target program

use hope_common::{Error, Result};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use crate::db::programs;
use crate::services::batch_coordinator::{
    BatchCoordinator, BatchItem, BatchRunReport, ItemHandler, ItemOutcome, Tally,
};
use crate::services::representation_copier::{RepresentationCopier, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentItem {
    Household(Uuid),
    Individual(Uuid),
}

impl BatchItem for EnrollmentItem {
    fn key(&self) -> String {
        match self {
            EnrollmentItem::Household(id) => format!("household:{}", id),
            EnrollmentItem::Individual(id) => format!("individual:{}", id),
        }
    }
}

/// How the requested entities were represented
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollmentTally {
    pub existing: usize,
    pub adjusted_in_place: usize,
    pub copied: usize,
}

impl Tally for EnrollmentTally {
    fn absorb(&mut self, other: Self) {
        self.existing += other.existing;
        self.adjusted_in_place += other.adjusted_in_place;
        self.copied += other.copied;
    }
}

struct EnrollmentHandler {
    program_id: Uuid,
}

impl ItemHandler for EnrollmentHandler {
    type Item = EnrollmentItem;
    type Tally = EnrollmentTally;

    fn operation(&self) -> &'static str {
        "enroll"
    }

    async fn handle(
        &self,
        conn: &mut SqliteConnection,
        item: &EnrollmentItem,
    ) -> Result<ItemOutcome<EnrollmentTally>> {
        // Fresh memo per item: a rolled-back item must not leak ids
        let mut copier = RepresentationCopier::new();
        let representation = match item {
            EnrollmentItem::Household(id) => {
                copier
                    .household_representation(conn, *id, self.program_id)
                    .await?
            }
            EnrollmentItem::Individual(id) => {
                copier
                    .individual_representation(conn, *id, self.program_id)
                    .await?
            }
        };

        let mut tally = EnrollmentTally::default();
        match representation.resolution {
            Resolution::Existing => tally.existing = 1,
            Resolution::AdjustedInPlace => tally.adjusted_in_place = 1,
            Resolution::Copied => tally.copied = 1,
        }
        Ok(ItemOutcome::new(copier.into_mutations(), tally))
    }
}

pub struct EnrollmentService<'a> {
    coordinator: &'a BatchCoordinator,
}

impl<'a> EnrollmentService<'a> {
    pub fn new(coordinator: &'a BatchCoordinator) -> Self {
        Self { coordinator }
    }

    /// Enroll households (with members, head, roles and cards)
    pub async fn enroll(
        &self,
        household_ids: &[Uuid],
        program_id: Uuid,
        start: usize,
    ) -> Result<BatchRunReport<EnrollmentTally>> {
        let items: Vec<EnrollmentItem> = household_ids
            .iter()
            .copied()
            .map(EnrollmentItem::Household)
            .collect();
        self.run(&items, program_id, start).await
    }

    /// Enroll individuals outside any household copy
    pub async fn enroll_individuals(
        &self,
        individual_ids: &[Uuid],
        program_id: Uuid,
        start: usize,
    ) -> Result<BatchRunReport<EnrollmentTally>> {
        let items: Vec<EnrollmentItem> = individual_ids
            .iter()
            .copied()
            .map(EnrollmentItem::Individual)
            .collect();
        self.run(&items, program_id, start).await
    }

    async fn run(
        &self,
        items: &[EnrollmentItem],
        program_id: Uuid,
        start: usize,
    ) -> Result<BatchRunReport<EnrollmentTally>> {
        let mut conn = self.coordinator.pool().acquire().await?;
        let program = programs::load_program(&mut conn, program_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Program {}", program_id)))?;
        drop(conn);

        info!(program = %program.name, items = items.len(), start, "Enrollment started");
        let report = self.coordinator.run(&EnrollmentHandler { program_id }, items, start).await;
        info!(
            program = %program.name,
            succeeded = report.succeeded,
            failed = report.failures.len(),
            copied = report.tally.copied,
            in_place = report.tally.adjusted_in_place,
            "Enrollment finished"
        );
        Ok(report)
    }
}
