//! Business services: program representation, registration merge,
//! deduplication and adjudication, all driven through the batch coordinator

pub mod adjudication;
pub mod batch_coordinator;
pub mod collection_registry;
pub mod deduplication;
pub mod enrollment;
pub mod import_merge;
pub mod index_notifier;
pub mod representation_copier;
pub mod role_reassignment;

pub use batch_coordinator::{
    run_resumable, BatchCoordinator, BatchRunReport, EntityFailure, Interruption,
};
pub use index_notifier::{EventBusNotifier, IndexNotifier, MutationSet, NoopNotifier};
