//! hope-repr - command-line front end of the program representation engine
//!
//! Each subcommand opens the store, loads the runtime settings and drives one
//! bulk operation through the batch coordinator. Reports are printed as JSON
//! on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hope_common::config::{resolve_database_path, EngineSettings, TomlConfig};
use hope_common::db::init_database;
use hope_common::events::{EventBus, ReprEvent};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use hope_repr::db::documents;
use hope_repr::services::adjudication::{close_tickets, AdjudicationRequest};
use hope_repr::services::deduplication::{DedupScope, DeduplicationEngine};
use hope_repr::services::enrollment::EnrollmentService;
use hope_repr::services::import_merge::ImportMerger;
use hope_repr::services::role_reassignment::ReassignmentEntry;
use hope_repr::services::{
    run_resumable, BatchCoordinator, BatchRunReport, EventBusNotifier, Interruption,
};
use hope_repr::utils::retry_on_lock;

/// Command-line arguments for hope-repr
#[derive(Parser, Debug)]
#[command(name = "hope-repr")]
#[command(about = "Program representation engine for HOPE registries")]
#[command(version)]
struct Args {
    /// SQLite database file
    #[arg(short, long, global = true, env = "HOPE_REPR_DATABASE")]
    database: Option<PathBuf>,

    /// TOML bootstrap config file
    #[arg(short, long, global = true, env = "HOPE_REPR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive (overrides the config file; RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Represent households (members, head, roles, cards) in a program
    Enroll {
        /// Target program
        #[arg(long)]
        program: Uuid,

        /// Enroll individuals instead of households
        #[arg(long)]
        individuals: bool,

        /// Household (or individual) ids
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Merge a registration import into the registry
    MergeImport {
        /// Registration import id
        import: Uuid,
    },

    /// Deduplicate merged, undecided documents of a business area
    Deduplicate {
        #[arg(long)]
        business_area: Uuid,

        /// Narrow the run to one program
        #[arg(long)]
        program: Option<Uuid>,
    },

    /// Close a needs-adjudication ticket
    CloseTicket {
        #[arg(long)]
        ticket: Uuid,

        /// Individuals confirmed as distinct persons
        #[arg(long, num_args = 1..)]
        distinct: Vec<Uuid>,

        /// Individuals confirmed as duplicates
        #[arg(long, num_args = 1..)]
        duplicate: Vec<Uuid>,

        /// JSON file with role reassignments for the duplicates
        #[arg(long)]
        reassignments: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = TomlConfig::load_or_default(args.config.as_deref());

    // Initialize tracing
    let default_filter = args
        .log_level
        .clone()
        .unwrap_or_else(|| toml_config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let db_path = resolve_database_path(args.database.as_deref(), &toml_config);
    info!("Database: {}", db_path.display());

    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let settings = EngineSettings::load(&pool).await.context("Failed to load engine settings")?;
    debug!(?settings, "Engine settings loaded");

    let bus = EventBus::new(1024);
    spawn_event_logger(&bus);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        });
    }

    let engine = Engine {
        pool,
        bus,
        cancel,
        settings,
    };

    let output = match args.command {
        Command::Enroll {
            program,
            individuals,
            ids,
        } => engine.enroll(program, individuals, &ids).await?,
        Command::MergeImport { import } => engine.merge_import(import).await?,
        Command::Deduplicate {
            business_area,
            program,
        } => engine.deduplicate(business_area, program).await?,
        Command::CloseTicket {
            ticket,
            distinct,
            duplicate,
            reassignments,
        } => {
            let reassignments = match reassignments {
                Some(path) => read_reassignments(&path)?,
                None => Vec::new(),
            };
            let request = AdjudicationRequest {
                ticket_id: ticket,
                distinct,
                duplicates: duplicate,
                reassignments,
            };
            engine.close_ticket(request).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    engine.pool.close().await;
    Ok(())
}

struct Engine {
    pool: SqlitePool,
    bus: EventBus,
    cancel: CancellationToken,
    settings: EngineSettings,
}

impl Engine {
    fn coordinator(&self, batch_size: usize) -> BatchCoordinator {
        BatchCoordinator::new(
            self.pool.clone(),
            Arc::new(EventBusNotifier::new(self.bus.clone())),
            batch_size,
        )
        .with_cancellation(self.cancel.clone())
    }

    async fn enroll(
        &self,
        program_id: Uuid,
        individuals: bool,
        ids: &[Uuid],
    ) -> Result<serde_json::Value> {
        let coordinator = self.coordinator(self.settings.enrollment_batch_size);
        let service = EnrollmentService::new(&coordinator);
        let service = &service;

        let max_wait_ms = self.settings.database_max_lock_wait_ms;
        let report = run_resumable("enroll", max_wait_ms, move |start| async move {
            if individuals {
                service.enroll_individuals(ids, program_id, start).await
            } else {
                service.enroll(ids, program_id, start).await
            }
        })
        .await
        .context("Enrollment failed")?;

        Ok(report_json(&report))
    }

    async fn merge_import(&self, import_id: Uuid) -> Result<serde_json::Value> {
        let merge = self.coordinator(self.settings.merge_batch_size);
        let dedup = self.coordinator(self.settings.deduplication_batch_size);
        let merger = ImportMerger::new(&merge, &dedup);

        // Promotion is idempotent, so a locked store restarts the whole merge
        let report = retry_on_lock(
            "merge_import",
            self.settings.database_max_lock_wait_ms,
            || merger.merge(import_id),
        )
        .await
        .context("Import merge failed")?;

        Ok(json!({
            "import_id": report.import_id,
            "status": report.status.to_string(),
            "merge": report_json(&report.merge),
            "deduplication": report.deduplication.as_ref().map(report_json),
        }))
    }

    async fn deduplicate(
        &self,
        business_area_id: Uuid,
        program_id: Option<Uuid>,
    ) -> Result<serde_json::Value> {
        let mut conn = self.pool.acquire().await?;
        let pending =
            documents::pending_decision_in_area(&mut conn, business_area_id, program_id).await?;
        drop(conn);
        info!(
            business_area = %business_area_id,
            documents = pending.len(),
            "Deduplication requested"
        );

        let coordinator = self.coordinator(self.settings.deduplication_batch_size);
        let engine = DeduplicationEngine::new(&coordinator);
        let engine = &engine;
        let pending = &pending[..];
        let scope = DedupScope {
            business_area_id,
            program_id,
        };

        let max_wait_ms = self.settings.database_max_lock_wait_ms;
        let report = run_resumable("deduplicate", max_wait_ms, move |start| {
            engine.deduplicate(pending, scope, start)
        })
        .await
        .context("Deduplication failed")?;

        Ok(report_json(&report))
    }

    async fn close_ticket(&self, request: AdjudicationRequest) -> Result<serde_json::Value> {
        let coordinator = self.coordinator(1);
        let coordinator = &coordinator;
        let requests = std::slice::from_ref(&request);

        let max_wait_ms = self.settings.database_max_lock_wait_ms;
        let report = run_resumable("close_ticket", max_wait_ms, move |start| async move {
            Ok(close_tickets(coordinator, requests, start).await)
        })
        .await
        .context("Closing the ticket failed")?;

        if let Some(failure) = report.failures.first() {
            bail!("Ticket {} not closed: {} {}", failure.key, failure.kind, failure.message);
        }
        Ok(report_json(&report))
    }
}

fn report_json<T: Serialize>(report: &BatchRunReport<T>) -> serde_json::Value {
    let interruption = report.interruption.as_ref().map(|i| match i {
        Interruption::Cancelled => "cancelled".to_string(),
        Interruption::Failed(err) => err.to_string(),
    });
    json!({
        "operation": report.operation,
        "total": report.total,
        "succeeded": report.succeeded,
        "failures": report.failures,
        "batches_committed": report.batches_committed,
        "tally": report.tally,
        "resume_from": report.resume_from,
        "interruption": interruption,
    })
}

fn read_reassignments(path: &std::path::Path) -> Result<Vec<ReassignmentEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse reassignments in {}", path.display()))
}

/// Log committed batches until the bus is dropped
fn spawn_event_logger(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ReprEvent::ReindexRequested {
                    household_ids,
                    individual_ids,
                    ..
                }) => {
                    debug!(
                        households = household_ids.len(),
                        individuals = individual_ids.len(),
                        "Re-index requested"
                    );
                }
                Ok(ReprEvent::BatchCommitted {
                    operation,
                    batch_index,
                    succeeded,
                    failed,
                    ..
                }) => {
                    info!(
                        operation = %operation,
                        batch = batch_index,
                        succeeded,
                        failed,
                        "Batch committed"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event logger lagged, {} events skipped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
