use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::ChangeEvent;

use super::conflict::{self, Conflict, Proposal, Severity};
use super::outcome::*;
use super::store;
use super::transaction::{ChunkTx, LocateError};
use super::validation::{item_data, validate_request, NewAllocation, Operation, Patch};
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkOptions {
    /// `None` takes the coordinator's configured default.
    pub chunk_size: Option<usize>,
    pub continue_on_error: bool,
    /// Write even when a conflict would block.
    pub force_create: bool,
    /// Lowest severity that blocks a write.
    pub block_severity: Severity,
    /// Hard-delete with time entries instead of soft-deleting.
    pub cascade_delete: bool,
    pub validate_before_commit: bool,
    #[serde(rename = "async")]
    pub run_async: bool,
    pub owner_id: Option<String>,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            continue_on_error: false,
            force_create: false,
            block_severity: Severity::Critical,
            cascade_delete: false,
            validate_before_commit: true,
            run_async: false,
            owner_id: None,
        }
    }
}

impl BulkOptions {
    /// Effective chunk size after bounds checks.
    pub fn checked_chunk_size(&self) -> Result<usize, EngineError> {
        let size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(EngineError::InvalidInput(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if let Some(ref owner) = self.owner_id
            && owner.len() > MAX_OWNER_LEN {
                return Err(EngineError::LimitExceeded("owner_id too long"));
            }
        Ok(size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_index: usize,
    pub chunks_total: usize,
    pub committed: bool,
}

/// Hooks the executor calls between chunks. Cancellation and timeouts are only
/// honoured here, never inside a chunk.
#[async_trait]
pub trait ChunkObserver: Send + Sync {
    async fn before_chunk(&self, _chunk_index: usize) -> Flow {
        Flow::Continue
    }

    async fn chunk_finished(&self, _progress: ChunkProgress, _so_far: &BulkResult) {}
}

pub struct NoopObserver;

#[async_trait]
impl ChunkObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub result: BulkResult,
    /// Set when the observer stopped the run between chunks.
    pub stop: Option<StopReason>,
    /// Set when a strict-mode failure or a storage error ended the run.
    pub aborted: Option<String>,
}

struct Staged {
    item: SuccessItem,
    conflicts: Vec<Conflict>,
}

struct Rejected {
    error: OperationError,
    conflicts: Vec<Conflict>,
}

impl From<OperationError> for Rejected {
    fn from(error: OperationError) -> Self {
        Self {
            error,
            conflicts: Vec::new(),
        }
    }
}

fn located(id: Ulid, res: Result<&Allocation, LocateError>) -> Result<Allocation, OperationError> {
    match res {
        Ok(a) => Ok(a.clone()),
        Err(LocateError::Missing) => Err(OperationError::not_found(id)),
        Err(LocateError::Moved) => Err(concurrently_modified(id)),
    }
}

fn concurrently_modified(id: Ulid) -> OperationError {
    OperationError::constraint(
        "concurrent_modification",
        Some("id"),
        format!("allocation {id} was modified concurrently, retry"),
    )
}

impl Engine {
    /// Run `requests` in ordered chunks, each chunk one transaction.
    ///
    /// Strict mode (the default) stops at the first failing item: its chunk is
    /// rolled back and later chunks never run. Lenient mode drops failing
    /// items from their chunk and commits the rest. Earlier committed chunks
    /// always stay committed.
    pub async fn execute(
        &self,
        requests: &[OperationRequest],
        options: &BulkOptions,
        observer: &dyn ChunkObserver,
    ) -> Result<Execution, EngineError> {
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let chunk_size = options.checked_chunk_size()?;
        let started = Instant::now();
        let chunks_total = requests.len().div_ceil(chunk_size);
        let mut result = BulkResult::new(Ulid::new(), chunks_total);
        let mut stop = None;
        let mut aborted = None;
        let strict = !options.continue_on_error;

        let parsed: Option<Vec<Result<Operation, OperationError>>> = options
            .validate_before_commit
            .then(|| requests.iter().map(validate_request).collect());

        if strict
            && let Some(ref parsed) = parsed {
                let invalid: Vec<FailedItem> = parsed
                    .iter()
                    .enumerate()
                    .filter_map(|(index, p)| {
                        p.as_ref().err().map(|error| FailedItem {
                            index,
                            data: item_data(&requests[index]),
                            error: error.clone(),
                        })
                    })
                    .collect();
                if !invalid.is_empty() {
                    let message = format!(
                        "{} item(s) failed validation, nothing was written",
                        invalid.len()
                    );
                    warn!(transaction_id = %result.transaction_id, invalid = invalid.len(), "bulk request rejected in validation");
                    result.warnings.push(message.clone());
                    result.record_failures(invalid);
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    return Ok(Execution {
                        result,
                        stop: None,
                        aborted: Some(message),
                    });
                }
            }

        for (chunk_index, chunk) in requests.chunks(chunk_size).enumerate() {
            let offset = chunk_index * chunk_size;
            if let Flow::Stop(reason) = observer.before_chunk(chunk_index).await {
                result.warnings.push(format!(
                    "stopped before chunk {} of {chunks_total}, {} item(s) not attempted",
                    chunk_index + 1,
                    requests.len() - offset
                ));
                stop = Some(reason);
                break;
            }

            let pre = parsed.as_ref().map(|p| &p[offset..offset + chunk.len()]);
            let outcome = self.run_chunk(chunk_index, offset, chunk, pre, options).await;
            let committed = outcome.committed;
            let abort = outcome.abort.clone();
            if committed {
                metrics::counter!(crate::observability::CHUNKS_COMMITTED_TOTAL).increment(1);
            } else {
                metrics::counter!(crate::observability::CHUNKS_ROLLED_BACK_TOTAL).increment(1);
            }
            result.absorb(outcome);
            result.duration_ms = started.elapsed().as_millis() as u64;
            observer
                .chunk_finished(
                    ChunkProgress {
                        chunk_index,
                        chunks_total,
                        committed,
                    },
                    &result,
                )
                .await;

            if let Some(message) = abort {
                let remaining = requests.len() - (offset + chunk.len());
                if remaining > 0 {
                    result
                        .warnings
                        .push(format!("{remaining} item(s) after chunk {} not attempted", chunk_index + 1));
                }
                aborted = Some(message);
                break;
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(Execution {
            result,
            stop,
            aborted,
        })
    }

    /// Dry run: the same validation, locks and conflict checks as `execute`,
    /// every item staged in order, nothing committed.
    pub async fn validate(
        &self,
        requests: &[OperationRequest],
        options: &BulkOptions,
    ) -> Result<ValidationReport, EngineError> {
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        options.checked_chunk_size()?;

        let ops: Vec<Result<Operation, OperationError>> =
            requests.iter().map(validate_request).collect();
        let mut lock_set = BTreeSet::new();
        for op in ops.iter().flatten() {
            self.collect_locks(op, &mut lock_set);
        }

        let mut tx = ChunkTx::begin(self, lock_set).await;
        let now = now_ms();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut conflicts = Vec::new();
        for (index, op) in ops.into_iter().enumerate() {
            let staged = match op {
                Ok(op) => self.stage(&mut tx, op, options, index, now),
                Err(e) => Err(e.into()),
            };
            match staged {
                Ok(s) => {
                    warnings.extend(s.conflicts.iter().map(|c| format!("item {index}: {}", c.describe())));
                    conflicts.extend(s.conflicts);
                }
                Err(r) => {
                    errors.push(FailedItem {
                        index,
                        data: item_data(&requests[index]),
                        error: r.error,
                    });
                    conflicts.extend(r.conflicts);
                }
            }
        }
        drop(tx);

        Ok(ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
            conflicts,
        })
    }

    async fn run_chunk(
        &self,
        chunk_index: usize,
        offset: usize,
        requests: &[OperationRequest],
        pre: Option<&[Result<Operation, OperationError>]>,
        options: &BulkOptions,
    ) -> ChunkOutcome {
        let strict = !options.continue_on_error;
        let ops: Vec<Result<Operation, OperationError>> = match pre {
            Some(p) => p.to_vec(),
            None => requests.iter().map(validate_request).collect(),
        };

        // Lazy validation in strict mode: reject before locking anything.
        if strict && ops.iter().any(|o| o.is_err()) {
            let errors: HashMap<usize, OperationError> = ops
                .iter()
                .enumerate()
                .filter_map(|(i, o)| o.as_ref().err().map(|e| (i, e.clone())))
                .collect();
            let first = errors.keys().min().copied().unwrap_or_default();
            let message = format!(
                "item {} failed validation, chunk {} rolled back",
                offset + first,
                chunk_index + 1
            );
            return rolled_back_chunk(chunk_index, offset, requests, errors, Vec::new(), message);
        }

        let mut lock_set = BTreeSet::new();
        for op in ops.iter().flatten() {
            self.collect_locks(op, &mut lock_set);
        }
        let mut tx = ChunkTx::begin(self, lock_set).await;
        let now = now_ms();
        let mut items = Vec::with_capacity(ops.len());
        let mut conflicts = Vec::new();

        for (local, op) in ops.into_iter().enumerate() {
            let index = offset + local;
            let staged = match op {
                Ok(op) => self.stage(&mut tx, op, options, index, now),
                Err(e) => Err(e.into()),
            };
            match staged {
                Ok(s) => {
                    conflicts.extend(s.conflicts);
                    items.push(ItemOutcome::Succeeded(s.item));
                }
                Err(r) if strict => {
                    drop(tx);
                    let message = format!(
                        "item {index} failed: {}; chunk {} rolled back",
                        r.error.message,
                        chunk_index + 1
                    );
                    warn!(chunk = chunk_index, index, kind = r.error.kind.as_str(), "chunk rolled back");
                    let errors = HashMap::from([(local, r.error)]);
                    return rolled_back_chunk(chunk_index, offset, requests, errors, r.conflicts, message);
                }
                Err(r) => {
                    conflicts.extend(r.conflicts);
                    items.push(ItemOutcome::Failed(FailedItem {
                        index,
                        data: item_data(&requests[local]),
                        error: r.error,
                    }));
                }
            }
        }

        match tx.commit().await {
            Ok(events) => {
                debug!(chunk = chunk_index, items = items.len(), events, "chunk committed");
                ChunkOutcome {
                    chunk_index,
                    committed: true,
                    items,
                    conflicts,
                    abort: None,
                }
            }
            Err(e) => {
                warn!(chunk = chunk_index, error = %e, "chunk commit failed");
                let message = format!("chunk {} could not be committed: {e}", chunk_index + 1);
                let items = items
                    .into_iter()
                    .map(|item| match item {
                        ItemOutcome::Succeeded(s) => ItemOutcome::Failed(FailedItem {
                            index: s.index,
                            data: item_data(&requests[s.index - offset]),
                            error: OperationError::storage(e.to_string()),
                        }),
                        failed => failed,
                    })
                    .collect();
                conflicts.retain(|c| c.blocked);
                ChunkOutcome {
                    chunk_index,
                    committed: false,
                    items,
                    conflicts,
                    abort: Some(message),
                }
            }
        }
    }

    /// Employees whose ledgers an operation reads or writes.
    fn collect_locks(&self, op: &Operation, out: &mut BTreeSet<Ulid>) {
        let owner = |id: &Ulid| self.allocation_index.get(id).map(|e| *e.value());
        match op {
            Operation::Create(new) => {
                out.insert(new.employee_id);
            }
            Operation::Update { id, patch } => {
                out.extend(owner(id));
                out.extend(patch.employee_id);
            }
            Operation::Delete { id } => {
                out.extend(owner(id));
            }
            Operation::Copy {
                source_id,
                target_employee_id,
                ..
            } => {
                out.extend(owner(source_id));
                out.extend(*target_employee_id);
            }
        }
    }

    fn stage(
        &self,
        tx: &mut ChunkTx<'_>,
        op: Operation,
        options: &BulkOptions,
        index: usize,
        now: Ms,
    ) -> Result<Staged, Rejected> {
        match op {
            Operation::Create(new) => self.stage_create(tx, new, options, index, now),
            Operation::Update { id, patch } => self.stage_update(tx, id, patch, options, index, now),
            Operation::Delete { id } => self.stage_delete(tx, id, options, index, now),
            Operation::Copy {
                source_id,
                shift_days,
                target_project_id,
                target_employee_id,
            } => {
                let source = located(source_id, tx.locate(&source_id))?;
                if !source.is_active {
                    return Err(OperationError::constraint(
                        "not_found",
                        Some("source_id"),
                        format!("source allocation {source_id} is deleted"),
                    )
                    .into());
                }
                let range = source.range.shift(shift_days).ok_or_else(|| {
                    OperationError::validation("shift_days", "shifted range is outside the calendar")
                })?;
                let new = NewAllocation {
                    employee_id: target_employee_id.unwrap_or(source.employee_id),
                    project_id: target_project_id.unwrap_or(source.project_id),
                    range,
                    allocated_hours: source.allocated_hours,
                    role: source.role.clone(),
                    status: AllocationStatus::Active,
                };
                self.stage_create(tx, new, options, index, now)
            }
        }
    }

    fn stage_create(
        &self,
        tx: &mut ChunkTx<'_>,
        new: NewAllocation,
        options: &BulkOptions,
        index: usize,
        now: Ms,
    ) -> Result<Staged, Rejected> {
        self.check_project(new.project_id)?;
        let ledger = writable_employee(tx, new.employee_id)?;
        let allocation = Allocation {
            id: Ulid::new(),
            employee_id: new.employee_id,
            project_id: new.project_id,
            range: new.range,
            allocated_hours: new.allocated_hours,
            role: new.role,
            status: new.status,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let conflicts = detect(ledger, &allocation, None, options, index)?;

        tx.apply(Event::AllocationCreated(allocation.clone()));
        tx.publish(ChangeEvent::AllocationCreated {
            allocation: allocation.clone(),
            timestamp: now,
        });
        publish_conflicts(tx, &allocation, &conflicts, now);
        Ok(Staged {
            item: SuccessItem {
                index,
                allocation_id: allocation.id,
                allocation: Some(allocation),
                cascaded: Vec::new(),
            },
            conflicts,
        })
    }

    fn stage_update(
        &self,
        tx: &mut ChunkTx<'_>,
        id: Ulid,
        patch: Patch,
        options: &BulkOptions,
        index: usize,
        now: Ms,
    ) -> Result<Staged, Rejected> {
        let current = located(id, tx.locate(&id))?;
        if !current.is_active {
            return Err(OperationError::constraint(
                "not_found",
                Some("id"),
                format!("allocation {id} is already deleted"),
            )
            .into());
        }
        let merged = patch.merge(&current, now)?;
        if merged.project_id != current.project_id {
            self.check_project(merged.project_id)?;
        }
        let ledger = if merged.employee_id != current.employee_id {
            writable_employee(tx, merged.employee_id)?
        } else {
            tx.ledger(&merged.employee_id)
                .ok_or_else(|| concurrently_modified(id))?
        };
        let conflicts = detect(ledger, &merged, Some(id), options, index)?;

        let moved = merged.employee_id != current.employee_id;
        tx.apply(Event::AllocationUpdated {
            previous_employee_id: current.employee_id,
            allocation: merged.clone(),
        });
        tx.publish(ChangeEvent::AllocationUpdated {
            allocation: merged.clone(),
            previous_employee_id: moved.then_some(current.employee_id),
            previous_project_id: (merged.project_id != current.project_id)
                .then_some(current.project_id),
            timestamp: now,
        });
        publish_conflicts(tx, &merged, &conflicts, now);
        Ok(Staged {
            item: SuccessItem {
                index,
                allocation_id: id,
                allocation: Some(merged),
                cascaded: Vec::new(),
            },
            conflicts,
        })
    }

    fn stage_delete(
        &self,
        tx: &mut ChunkTx<'_>,
        id: Ulid,
        options: &BulkOptions,
        index: usize,
        now: Ms,
    ) -> Result<Staged, Rejected> {
        let current = located(id, tx.locate(&id))?;
        if !current.is_active {
            return Err(OperationError::constraint(
                "not_found",
                Some("id"),
                format!("allocation {id} is already deleted"),
            )
            .into());
        }

        if options.cascade_delete {
            let Some(ledger) = tx.ledger(&current.employee_id) else {
                return Err(concurrently_modified(id).into());
            };
            let (events, cascaded) = store::cascade_delete(ledger, id);
            for event in events {
                tx.apply(event);
            }
            tx.publish(ChangeEvent::AllocationDeleted {
                allocation_id: id,
                employee_id: current.employee_id,
                project_id: current.project_id,
                cascaded: cascaded.clone(),
                soft: false,
                timestamp: now,
            });
            return Ok(Staged {
                item: SuccessItem {
                    index,
                    allocation_id: id,
                    allocation: None,
                    cascaded,
                },
                conflicts: Vec::new(),
            });
        }

        let mut deleted = current.clone();
        deleted.is_active = false;
        deleted.status = AllocationStatus::Cancelled;
        deleted.updated_at = now;
        tx.apply(Event::AllocationUpdated {
            previous_employee_id: current.employee_id,
            allocation: deleted.clone(),
        });
        tx.publish(ChangeEvent::AllocationDeleted {
            allocation_id: id,
            employee_id: current.employee_id,
            project_id: current.project_id,
            cascaded: Vec::new(),
            soft: true,
            timestamp: now,
        });
        Ok(Staged {
            item: SuccessItem {
                index,
                allocation_id: id,
                allocation: Some(deleted),
                cascaded: Vec::new(),
            },
            conflicts: Vec::new(),
        })
    }

    fn check_project(&self, project_id: Ulid) -> Result<(), OperationError> {
        match self.projects.get(&project_id) {
            None => Err(OperationError::constraint(
                "foreign_key",
                Some("project_id"),
                format!("project {project_id} does not exist"),
            )),
            Some(p) if !p.is_active => Err(OperationError::constraint(
                "inactive",
                Some("project_id"),
                format!("project {project_id} is inactive"),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// The locked ledger of an employee that may receive a new allocation.
fn writable_employee<'t>(tx: &'t ChunkTx<'_>, employee_id: Ulid) -> Result<&'t EmployeeLedger, OperationError> {
    let ledger = tx.ledger(&employee_id).ok_or_else(|| {
        OperationError::constraint(
            "foreign_key",
            Some("employee_id"),
            format!("employee {employee_id} does not exist"),
        )
    })?;
    if !ledger.is_active {
        return Err(OperationError::constraint(
            "inactive",
            Some("employee_id"),
            format!("employee {employee_id} is inactive"),
        ));
    }
    Ok(ledger)
}

/// Run the detector for a write and apply the blocking policy.
fn detect(
    ledger: &EmployeeLedger,
    allocation: &Allocation,
    exclude: Option<Ulid>,
    options: &BulkOptions,
    index: usize,
) -> Result<Vec<Conflict>, Rejected> {
    if !allocation.counts_toward_load() {
        return Ok(Vec::new());
    }
    let proposal = Proposal {
        allocation_id: exclude,
        project_id: allocation.project_id,
        range: allocation.range,
        allocated_hours: allocation.allocated_hours,
    };
    let mut conflicts = conflict::evaluate(&proposal, ledger).conflicts;

    let mut blocking = None;
    for c in conflicts.iter_mut() {
        c.index = Some(index);
        metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL, "kind" => c.kind.as_str())
            .increment(1);
        if conflict::is_blocking(c, options.force_create, options.block_severity) {
            c.blocked = true;
            blocking.get_or_insert_with(|| c.describe());
        }
    }
    match blocking {
        Some(message) => Err(Rejected {
            error: OperationError::blocked(message),
            conflicts,
        }),
        None => Ok(conflicts),
    }
}

fn publish_conflicts(tx: &mut ChunkTx<'_>, allocation: &Allocation, conflicts: &[Conflict], now: Ms) {
    if conflicts.is_empty() {
        return;
    }
    tx.publish(ChangeEvent::ConflictDetected {
        allocation_id: Some(allocation.id),
        employee_id: allocation.employee_id,
        project_id: allocation.project_id,
        conflicts: conflicts.to_vec(),
        timestamp: now,
    });
}

/// A chunk that wrote nothing: items with their own error keep it, the rest
/// are reported as rolled back.
fn rolled_back_chunk(
    chunk_index: usize,
    offset: usize,
    requests: &[OperationRequest],
    mut errors: HashMap<usize, OperationError>,
    conflicts: Vec<Conflict>,
    message: String,
) -> ChunkOutcome {
    let items = requests
        .iter()
        .enumerate()
        .map(|(local, request)| {
            ItemOutcome::Failed(FailedItem {
                index: offset + local,
                data: item_data(request),
                error: errors.remove(&local).unwrap_or_else(OperationError::rolled_back),
            })
        })
        .collect();
    ChunkOutcome {
        chunk_index,
        committed: false,
        items,
        conflicts,
        abort: Some(message),
    }
}
