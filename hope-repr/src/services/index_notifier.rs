//! Post-commit notification of mutated entities
//!
//! Work items collect the households and individuals they touched in a
//! [`MutationSet`]. The batch coordinator merges the sets of committed items
//! and hands them to an [`IndexNotifier`] only after the batch commits.

use hope_common::events::{EventBus, ReprEvent};
use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Households and individuals created or changed by a unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationSet {
    pub households: BTreeSet<Uuid>,
    pub individuals: BTreeSet<Uuid>,
}

impl MutationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_household(&mut self, id: Uuid) {
        self.households.insert(id);
    }

    pub fn add_individual(&mut self, id: Uuid) {
        self.individuals.insert(id);
    }

    pub fn add_individuals<I: IntoIterator<Item = Uuid>>(&mut self, ids: I) {
        self.individuals.extend(ids);
    }

    pub fn merge(&mut self, other: MutationSet) {
        self.households.extend(other.households);
        self.individuals.extend(other.individuals);
    }

    pub fn is_empty(&self) -> bool {
        self.households.is_empty() && self.individuals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.households.len() + self.individuals.len()
    }
}

/// Summary of a committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub operation: &'static str,
    pub batch_index: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Downstream search-index synchronizer
pub trait IndexNotifier: Send + Sync {
    /// Entities of a committed batch must be re-indexed
    fn reindex(&self, mutated: &MutationSet);

    /// A batch committed
    fn batch_committed(&self, _summary: &BatchSummary) {}
}

/// Publishes on the shared [`EventBus`]
pub struct EventBusNotifier {
    bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl IndexNotifier for EventBusNotifier {
    fn reindex(&self, mutated: &MutationSet) {
        if mutated.is_empty() {
            return;
        }
        self.bus.emit_lossy(ReprEvent::ReindexRequested {
            household_ids: mutated.households.iter().copied().collect(),
            individual_ids: mutated.individuals.iter().copied().collect(),
            timestamp: chrono::Utc::now(),
        });
    }

    fn batch_committed(&self, summary: &BatchSummary) {
        self.bus.emit_lossy(ReprEvent::BatchCommitted {
            operation: summary.operation.to_string(),
            batch_index: summary.batch_index,
            succeeded: summary.succeeded,
            failed: summary.failed,
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Discards notifications
pub struct NoopNotifier;

impl IndexNotifier for NoopNotifier {
    fn reindex(&self, _mutated: &MutationSet) {}
}
