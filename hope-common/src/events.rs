//! Engine events
//!
//! Provides the shared event definitions and the broadcast [`EventBus`].
//! Events are only emitted after the unit of work that produced them has
//! committed, so subscribers (the search-index synchronizer in particular)
//! never observe rolled-back ids.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Representation engine event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReprEvent {
    /// Entities were mutated by a committed batch and must be re-indexed
    ReindexRequested {
        /// Households created or changed
        household_ids: Vec<Uuid>,
        /// Individuals created or changed
        individual_ids: Vec<Uuid>,
        /// When the batch committed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A batch committed
    BatchCommitted {
        /// Operation name (`enrollment`, `import_merge`, ...)
        operation: String,
        /// Zero-based batch number within the run
        batch_index: usize,
        /// Items committed
        succeeded: usize,
        /// Items rolled back and reported
        failed: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast channel shared by the engine and its downstream collaborators
///
/// Cloning is cheap; all clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReprEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Subscribers that fall more than `capacity` events behind lose the
    /// oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ReprEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: ReprEvent) -> Result<usize, broadcast::error::SendError<ReprEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ReprEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
