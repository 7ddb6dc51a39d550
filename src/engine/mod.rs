mod conflict;
mod error;
mod executor;
mod mutations;
mod outcome;
mod queries;
mod store;
mod transaction;
mod validation;

pub use conflict::{evaluate, peak_weekly_load, severity_for, Conflict, ConflictKind, ConflictResult, Proposal, Severity};
pub use error::EngineError;
pub use executor::{BulkOptions, ChunkObserver, ChunkProgress, Execution, Flow, NoopObserver, StopReason};
pub use outcome::{BulkResult, ErrorKind, FailedItem, OperationError, SuccessItem, ValidationReport};
pub use queries::AllocationQuery;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Record, Wal};

pub type SharedLedger = Arc<RwLock<EmployeeLedger>>;

// ── WAL writer task ──────────────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Record, oneshot::Sender<io::Result<()>>);

/// Sole owner of the WAL. Every append already queued when the first one
/// arrives joins its batch; the batch shares one fsync and one result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                // Compaction must see everything appended before it.
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    // Nothing is buffered between batches, so this is the durable length.
    let start_len = wal.file_len()?;
    let mut appended = 0u64;
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
        appended += 1;
    }
    let Some(e) = append_err.or_else(|| wal.flush_sync().err()) else {
        return Ok(());
    };

    // Every caller is told this batch failed, so none of its frames may
    // survive into a later replay.
    warn!(error = %e, records = batch.len(), "WAL flush failed, truncating batch");
    if let Err(truncate_err) = wal.truncate_to(start_len, appended) {
        tracing::error!(error = %truncate_err, len = start_len, "could not truncate failed WAL batch");
    }
    Err(e)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let batch = vec![(record, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// In-memory allocation store backed by the WAL.
///
/// Employee ledgers are the unit of locking: every allocation and time entry
/// of an employee lives in that employee's ledger. Reference data (projects),
/// the allocation → employee index and bulk operation rows sit beside them in
/// lock-free maps that only change at commit.
pub struct Engine {
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) projects: DashMap<Ulid, ProjectInfo>,
    /// Allocation id → employee id.
    pub(super) allocation_index: DashMap<Ulid, Ulid>,
    pub(super) operations: DashMap<Ulid, BulkOperation>,
    pub(super) history: DashMap<Ulid, HistoryRecord>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Shared by every commit, exclusive for compaction.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let records = Wal::recover(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);

        let engine = Self {
            ledgers: DashMap::new(),
            projects: DashMap::new(),
            allocation_index: DashMap::new(),
            operations: DashMap::new(),
            history: DashMap::new(),
            wal_tx,
            notify,
            commit_gate: RwLock::new(()),
        };

        // Replay into plain maps; nothing else can see them yet.
        let mut ledgers: HashMap<Ulid, EmployeeLedger> = HashMap::new();
        let mut events = 0usize;
        for record in &records {
            for event in record {
                store::apply_event(&mut ledgers, event);
                engine.apply_shared(event);
                events += 1;
            }
        }
        for (id, ledger) in ledgers {
            engine.ledgers.insert(id, Arc::new(RwLock::new(ledger)));
        }

        // A job that was running when the process died will never finish.
        // Its failure is logged like any other terminal row, before the
        // writer task takes the WAL over.
        let now = now_ms();
        let interrupted: Vec<BulkOperation> = engine
            .operations
            .iter()
            .filter(|op| !op.status.is_terminal())
            .map(|op| BulkOperation {
                status: OperationStatus::Failed,
                error: Some("interrupted by restart".into()),
                completed_at: Some(now),
                ..op.clone()
            })
            .collect();
        let mut finished = Vec::with_capacity(interrupted.len() * 2);
        for op in interrupted {
            warn!(operation_id = %op.id, "bulk operation interrupted by restart");
            let history = HistoryRecord::from_operation(&op);
            let record = vec![Event::BulkOperationSaved(op), Event::HistoryAppended(history)];
            wal.append_buffered(&record)?;
            finished.extend(record);
        }
        if !finished.is_empty() {
            wal.flush_sync()?;
            for event in &finished {
                engine.apply_shared(event);
            }
        }
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        info!(
            records = records.len(),
            events,
            employees = engine.ledgers.len(),
            allocations = engine.allocation_index.len(),
            "WAL replayed"
        );
        Ok(engine)
    }

    /// Write one transaction to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, record: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Bookkeeping outside the ledgers: projects, allocation index,
    /// operation rows and history.
    pub(super) fn apply_shared(&self, event: &Event) {
        match event {
            Event::ProjectUpserted { id, name, is_active } => {
                self.projects.insert(
                    *id,
                    ProjectInfo {
                        id: *id,
                        name: name.clone(),
                        is_active: *is_active,
                    },
                );
            }
            Event::ProjectRemoved { id } => {
                self.projects.remove(id);
            }
            Event::AllocationCreated(a) => {
                self.allocation_index.insert(a.id, a.employee_id);
            }
            Event::AllocationUpdated { allocation, .. } => {
                self.allocation_index.insert(allocation.id, allocation.employee_id);
            }
            Event::AllocationDeleted { id, .. } => {
                self.allocation_index.remove(id);
            }
            Event::BulkOperationSaved(op) => {
                self.operations.insert(op.id, op.clone());
            }
            Event::HistoryAppended(record) => {
                self.history.insert(record.operation_id, record.clone());
            }
            Event::EmployeeUpserted { .. }
            | Event::EmployeeRemoved { .. }
            | Event::TimeEntryRecorded(_)
            | Event::TimeEntryDeleted { .. } => {}
        }
    }

    pub fn ledger(&self, employee_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(employee_id).map(|e| e.value().clone())
    }

    pub fn employee_for_allocation(&self, allocation_id: &Ulid) -> Option<Ulid> {
        self.allocation_index.get(allocation_id).map(|e| *e.value())
    }
}
