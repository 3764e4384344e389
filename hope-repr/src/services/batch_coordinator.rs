//! Bounded, resumable units of work
//!
//! Items are processed in batches of `batch_size`. Each batch is one
//! transaction whose first statement is the journal insert; each item runs
//! under its own SAVEPOINT.
//!
//! - Item-level errors (conflict, not found, duplicate constraint, invalid
//!   input) roll back the item only and are reported; the batch commits.
//! - Any other error rolls back the whole batch and stops the run with
//!   `resume_from` pointing at the batch's first item.
//! - Cancellation is checked before every batch and every item and also
//!   rolls back the open batch.
//!
//! The [`IndexNotifier`] hears about a batch only after it committed.

use hope_common::{Error, Result};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::cell::RefCell;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::journal;
use crate::services::index_notifier::{BatchSummary, IndexNotifier, MutationSet};
use crate::utils::{begin_monitored, retry_on_lock, MonitoredTransaction};

/// Something a batch processes
pub trait BatchItem {
    /// Identifier used in failure reports
    fn key(&self) -> String;
}

impl BatchItem for Uuid {
    fn key(&self) -> String {
        self.to_string()
    }
}

/// Per-operation counters accumulated over committed items
pub trait Tally: Default {
    fn absorb(&mut self, other: Self);
}

impl Tally for () {
    fn absorb(&mut self, _other: Self) {}
}

/// What one successful item changed
#[derive(Debug, Default)]
pub struct ItemOutcome<T> {
    pub mutations: MutationSet,
    pub tally: T,
}

impl<T: Tally> ItemOutcome<T> {
    pub fn new(mutations: MutationSet, tally: T) -> Self {
        Self { mutations, tally }
    }
}

/// Work applied to one item inside the batch transaction
#[allow(async_fn_in_trait)]
pub trait ItemHandler {
    type Item: BatchItem;
    type Tally: Tally;

    /// Journal and log name
    fn operation(&self) -> &'static str;

    async fn handle(
        &self,
        conn: &mut SqliteConnection,
        item: &Self::Item,
    ) -> Result<ItemOutcome<Self::Tally>>;
}

/// Reported item failure; the rest of its batch committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub key: String,
    pub kind: &'static str,
    pub message: String,
}

impl EntityFailure {
    fn new(key: String, err: &Error) -> Self {
        Self {
            key,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Why a run stopped before its last item
#[derive(Debug)]
pub enum Interruption {
    Cancelled,
    Failed(Error),
}

#[derive(Debug)]
pub struct BatchRunReport<T> {
    pub operation: &'static str,
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<EntityFailure>,
    pub batches_committed: usize,
    pub tally: T,
    /// Index of the first unprocessed item when the run stopped early
    pub resume_from: Option<usize>,
    pub interruption: Option<Interruption>,
}

impl<T: Tally> BatchRunReport<T> {
    pub fn new(operation: &'static str, total: usize) -> Self {
        Self {
            operation,
            total,
            succeeded: 0,
            failures: Vec::new(),
            batches_committed: 0,
            tally: T::default(),
            resume_from: None,
            interruption: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.interruption.is_none()
    }

    /// Fold a resumed run into this one
    pub fn absorb(&mut self, later: BatchRunReport<T>) {
        self.succeeded += later.succeeded;
        self.failures.extend(later.failures);
        self.batches_committed += later.batches_committed;
        self.tally.absorb(later.tally);
        self.resume_from = later.resume_from;
        self.interruption = later.interruption;
    }

    fn record(&mut self, batch: CommittedBatch<T>) {
        self.succeeded += batch.succeeded;
        self.failures.extend(batch.failures);
        self.batches_committed += 1;
        self.tally.absorb(batch.tally);
    }

    fn interrupt(&mut self, resume_from: usize, interruption: Interruption) {
        self.resume_from = Some(resume_from);
        self.interruption = Some(interruption);
    }
}

struct CommittedBatch<T> {
    succeeded: usize,
    failures: Vec<EntityFailure>,
    mutations: MutationSet,
    tally: T,
}

/// Runs [`ItemHandler`]s over item lists in journaled batches
pub struct BatchCoordinator {
    pool: SqlitePool,
    notifier: Arc<dyn IndexNotifier>,
    batch_size: usize,
    cancel: CancellationToken,
}

impl BatchCoordinator {
    pub fn new(pool: SqlitePool, notifier: Arc<dyn IndexNotifier>, batch_size: usize) -> Self {
        Self {
            pool,
            notifier,
            batch_size: batch_size.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Process `items[start..]`
    pub async fn run<H: ItemHandler>(
        &self,
        handler: &H,
        items: &[H::Item],
        start: usize,
    ) -> BatchRunReport<H::Tally> {
        let operation = handler.operation();
        let mut report = BatchRunReport::new(operation, items.len());
        if start >= items.len() {
            return report;
        }

        let mut offset = start;
        for chunk in items[start..].chunks(self.batch_size) {
            if self.cancel.is_cancelled() {
                warn!(operation, resume_from = offset, "Run cancelled");
                report.interrupt(offset, Interruption::Cancelled);
                break;
            }

            let batch_index = offset / self.batch_size;
            match self.run_batch(handler, chunk, batch_index).await {
                Ok(batch) => {
                    self.notifier.reindex(&batch.mutations);
                    self.notifier.batch_committed(&BatchSummary {
                        operation,
                        batch_index,
                        succeeded: batch.succeeded,
                        failed: batch.failures.len(),
                    });
                    info!(
                        operation,
                        batch_index,
                        succeeded = batch.succeeded,
                        failed = batch.failures.len(),
                        "Batch committed"
                    );
                    report.record(batch);
                }
                Err(Interruption::Cancelled) => {
                    warn!(
                        operation,
                        batch_index,
                        resume_from = offset,
                        "Run cancelled, open batch rolled back"
                    );
                    report.interrupt(offset, Interruption::Cancelled);
                    break;
                }
                Err(Interruption::Failed(err)) => {
                    error!(
                        operation,
                        batch_index,
                        resume_from = offset,
                        error = %err,
                        "Batch rolled back"
                    );
                    report.interrupt(offset, Interruption::Failed(err));
                    break;
                }
            }
            offset += chunk.len();
        }

        report
    }

    async fn run_batch<H: ItemHandler>(
        &self,
        handler: &H,
        chunk: &[H::Item],
        batch_index: usize,
    ) -> std::result::Result<CommittedBatch<H::Tally>, Interruption> {
        let mut tx = begin_monitored(&self.pool, handler.operation())
            .await
            .map_err(Interruption::Failed)?;

        match self.apply_items(handler, &mut tx, chunk, batch_index).await {
            Ok(batch) => {
                tx.commit().await.map_err(|e| Interruption::Failed(e.classify()))?;
                Ok(batch)
            }
            Err(interruption) => {
                if let Err(e) = tx.rollback().await {
                    warn!(operation = handler.operation(), error = %e, "Rollback failed");
                }
                Err(interruption)
            }
        }
    }

    async fn apply_items<H: ItemHandler>(
        &self,
        handler: &H,
        tx: &mut MonitoredTransaction<'_>,
        chunk: &[H::Item],
        batch_index: usize,
    ) -> std::result::Result<CommittedBatch<H::Tally>, Interruption> {
        let conn = tx.conn().map_err(Interruption::Failed)?;
        let journal_id = journal::open_batch(conn, handler.operation(), batch_index, chunk.len())
            .await
            .map_err(|e| Interruption::Failed(e.classify()))?;

        let mut batch = CommittedBatch {
            succeeded: 0,
            failures: Vec::new(),
            mutations: MutationSet::new(),
            tally: H::Tally::default(),
        };

        for item in chunk {
            if self.cancel.is_cancelled() {
                return Err(Interruption::Cancelled);
            }

            savepoint(conn, "SAVEPOINT batch_item").await?;
            match handler.handle(&mut *conn, item).await.map_err(Error::classify) {
                Ok(outcome) => {
                    savepoint(conn, "RELEASE SAVEPOINT batch_item").await?;
                    batch.mutations.merge(outcome.mutations);
                    batch.tally.absorb(outcome.tally);
                    batch.succeeded += 1;
                }
                Err(err) if err.is_item_level() => {
                    savepoint(conn, "ROLLBACK TO SAVEPOINT batch_item").await?;
                    savepoint(conn, "RELEASE SAVEPOINT batch_item").await?;
                    warn!(
                        operation = handler.operation(),
                        item = %item.key(),
                        kind = err.kind(),
                        error = %err,
                        "Item rolled back"
                    );
                    batch.failures.push(EntityFailure::new(item.key(), &err));
                }
                Err(err) => return Err(Interruption::Failed(err)),
            }
        }

        journal::finish_batch(conn, journal_id, batch.succeeded, batch.failures.len())
            .await
            .map_err(|e| Interruption::Failed(e.classify()))?;
        Ok(batch)
    }
}

async fn savepoint(
    conn: &mut SqliteConnection,
    statement: &str,
) -> std::result::Result<(), Interruption> {
    sqlx::query(statement)
        .execute(&mut *conn)
        .await
        .map_err(|e| Interruption::Failed(Error::Database(e).classify()))?;
    Ok(())
}

/// Drive a resumable run to completion, resuming after transient store
/// failures for up to `max_wait_ms`.
///
/// `attempt` receives the index to start from. Reports of the attempts are
/// folded together so failures committed by an early attempt are kept. An
/// attempt that fails before its run starts is retried like a lock error
/// when its error is retryable and returned otherwise.
pub async fn run_resumable<T, F, Fut>(
    operation: &str,
    max_wait_ms: u64,
    mut attempt: F,
) -> Result<BatchRunReport<T>>
where
    T: Tally,
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<BatchRunReport<T>>>,
{
    let progress: RefCell<Option<BatchRunReport<T>>> = RefCell::new(None);

    let outcome = retry_on_lock(operation, max_wait_ms, || {
        let start = progress.borrow().as_ref().and_then(|r| r.resume_from).unwrap_or(0);
        let run = attempt(start);
        let progress = &progress;
        async move {
            let report = run.await?;
            let mut merged = match progress.borrow_mut().take() {
                Some(mut earlier) => {
                    earlier.absorb(report);
                    earlier
                }
                None => report,
            };

            match merged.interruption.take() {
                Some(Interruption::Failed(err)) if err.is_retryable() => {
                    *progress.borrow_mut() = Some(merged);
                    Err(err)
                }
                other => {
                    merged.interruption = other;
                    Ok(merged)
                }
            }
        }
    })
    .await;

    match outcome {
        Ok(report) => Ok(report),
        // Retry budget spent: hand back what committed, marked as failed
        Err(err) => match progress.into_inner() {
            Some(mut report) => {
                report.interruption = Some(Interruption::Failed(err));
                Ok(report)
            }
            None => Err(err),
        },
    }
}
