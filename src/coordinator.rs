use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::engine::{
    BulkOptions, BulkResult, ChunkObserver, ChunkProgress, Engine, EngineError, Execution, Flow,
    StopReason, ValidationReport,
};
use crate::limits::*;
use crate::model::*;
use crate::notify::ChangeEvent;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Larger batches always run in the background.
    pub async_threshold: usize,
    pub operation_timeout: Duration,
    pub default_chunk_size: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            async_threshold: DEFAULT_ASYNC_THRESHOLD,
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// One bulk job as submitted: every item must be of `kind`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub kind: BulkKind,
    pub items: Vec<OperationRequest>,
    pub options: BulkOptions,
}

impl BulkRequest {
    pub fn create(items: Vec<AllocationInput>, options: BulkOptions) -> Self {
        Self {
            kind: BulkKind::Create,
            items: items.into_iter().map(OperationRequest::Create).collect(),
            options,
        }
    }

    pub fn update(items: Vec<UpdateItem>, options: BulkOptions) -> Self {
        Self {
            kind: BulkKind::Update,
            items: items.into_iter().map(OperationRequest::Update).collect(),
            options,
        }
    }

    pub fn delete(ids: Vec<String>, options: BulkOptions) -> Self {
        Self {
            kind: BulkKind::Delete,
            items: ids.into_iter().map(|id| OperationRequest::Delete { id }).collect(),
            options,
        }
    }

    pub fn copy(items: Vec<CopyItem>, options: BulkOptions) -> Self {
        Self {
            kind: BulkKind::Copy,
            items: items.into_iter().map(OperationRequest::Copy).collect(),
            options,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub operation_id: Ulid,
    pub current: u64,
    pub total: u64,
    pub percentage: u8,
}

/// Called after every chunk, on the task running the job.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkOperationStatus {
    #[serde(flatten)]
    pub operation: BulkOperation,
    pub percentage: u8,
}

impl From<BulkOperation> for BulkOperationStatus {
    fn from(operation: BulkOperation) -> Self {
        let percentage = operation.percentage();
        Self {
            operation,
            percentage,
        }
    }
}

/// Final state of a job that ran inline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub operation_id: Ulid,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub result: BulkResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    Finished(JobOutcome),
    /// Running in the background; poll `status`.
    Accepted(Ulid),
}

/// Registers bulk jobs, runs them through the executor and keeps their rows
/// current. Operation rows live in the engine (WAL-backed); cancellation
/// tokens and finished results live here.
pub struct Coordinator {
    engine: Arc<Engine>,
    settings: CoordinatorSettings,
    tokens: DashMap<Ulid, CancellationToken>,
    results: DashMap<Ulid, BulkResult>,
}

impl Coordinator {
    pub fn new(engine: Arc<Engine>, settings: CoordinatorSettings) -> Self {
        Self {
            engine,
            settings,
            tokens: DashMap::new(),
            results: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run inline or hand off to a background task, depending on size and
    /// `options.async`.
    pub async fn submit(
        self: &Arc<Self>,
        request: BulkRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Submitted, EngineError> {
        let background =
            request.options.run_async || request.items.len() > self.settings.async_threshold;
        let (op, request) = self.register(request).await?;
        if !background {
            return Ok(Submitted::Finished(self.run_registered(op, request, on_progress).await));
        }

        let id = op.id;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_registered(op, request, on_progress).await;
        });
        Ok(Submitted::Accepted(id))
    }

    /// `submit`, returning only the operation id. Inline jobs are terminal
    /// by the time this returns.
    pub async fn start(
        self: &Arc<Self>,
        request: BulkRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Ulid, EngineError> {
        match self.submit(request, on_progress).await? {
            Submitted::Finished(outcome) => Ok(outcome.operation_id),
            Submitted::Accepted(id) => Ok(id),
        }
    }

    /// Run to completion on the caller's task regardless of size.
    pub async fn run(
        &self,
        request: BulkRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<JobOutcome, EngineError> {
        let (op, request) = self.register(request).await?;
        Ok(self.run_registered(op, request, on_progress).await)
    }

    pub async fn validate(&self, request: BulkRequest) -> Result<ValidationReport, EngineError> {
        let request = self.normalize(request)?;
        self.engine.validate(&request.items, &request.options).await
    }

    pub fn status(&self, id: Ulid) -> Result<BulkOperationStatus, EngineError> {
        self.engine
            .get_operation(id)
            .map(BulkOperationStatus::from)
            .ok_or(EngineError::NotFound(id))
    }

    /// Request cancellation. Takes effect between chunks; a job that already
    /// finished is left as it is.
    pub fn cancel(&self, id: Ulid) -> Result<BulkOperationStatus, EngineError> {
        if let Some(token) = self.tokens.get(&id) {
            token.cancel();
            info!(operation_id = %id, "cancellation requested");
        }
        self.status(id)
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<HistoryRecord> {
        self.engine.list_history(limit)
    }

    /// Result of a job that finished since this process started.
    pub fn result(&self, id: Ulid) -> Option<BulkResult> {
        self.results.get(&id).map(|r| r.value().clone())
    }

    fn normalize(&self, mut request: BulkRequest) -> Result<BulkRequest, EngineError> {
        if request.items.iter().any(|i| i.kind() != request.kind) {
            return Err(EngineError::InvalidInput(format!(
                "bulk {} request contains items of another kind",
                request.kind.as_str()
            )));
        }
        if request.items.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        request
            .options
            .chunk_size
            .get_or_insert(self.settings.default_chunk_size);
        request.options.checked_chunk_size()?;
        Ok(request)
    }

    /// Validate the envelope, persist a pending row and arm a cancel token.
    async fn register(&self, request: BulkRequest) -> Result<(BulkOperation, BulkRequest), EngineError> {
        let request = self.normalize(request)?;
        let chunk_size = request.options.checked_chunk_size()?;
        let op = BulkOperation::new(
            Ulid::new(),
            request.kind,
            request.items.len() as u64,
            chunk_size as u64,
            request.options.owner_id.clone(),
        );
        self.engine.save_operation(&op).await?;
        self.tokens.insert(op.id, CancellationToken::new());
        Ok((op, request))
    }

    async fn run_registered(
        &self,
        mut op: BulkOperation,
        request: BulkRequest,
        on_progress: Option<ProgressCallback>,
    ) -> JobOutcome {
        let token = self
            .tokens
            .get(&op.id)
            .map(|t| t.value().clone())
            .unwrap_or_default();

        op.status = OperationStatus::Running;
        op.started_at = Some(now_ms());
        if let Err(e) = self.engine.save_operation(&op).await {
            warn!(operation_id = %op.id, error = %e, "could not persist running state");
        }
        info!(
            operation_id = %op.id,
            kind = op.kind.as_str(),
            items = op.total_records,
            chunks = op.chunks_total,
            "bulk operation started"
        );

        let observer = JobObserver {
            engine: &self.engine,
            op: Mutex::new(op.clone()),
            token,
            deadline: Instant::now() + self.settings.operation_timeout,
            timeout: self.settings.operation_timeout,
            on_progress,
        };
        let execution = self
            .engine
            .execute(&request.items, &request.options, &observer)
            .await;
        let mut op = observer.op.into_inner();

        let result = match execution {
            Ok(Execution {
                result,
                stop,
                aborted,
            }) => {
                op.successful_count = result.successful.len() as u64;
                op.failed_count = result.failed.len() as u64;
                match (stop, aborted) {
                    (Some(StopReason::Cancelled), _) => op.status = OperationStatus::Cancelled,
                    (Some(StopReason::TimedOut), _) => {
                        op.status = OperationStatus::Failed;
                        op.error = Some(format!(
                            "timed out after {}s",
                            self.settings.operation_timeout.as_secs()
                        ));
                    }
                    (None, Some(message)) => {
                        op.status = OperationStatus::Failed;
                        op.error = Some(message);
                    }
                    (None, None) => op.status = OperationStatus::Completed,
                }
                result
            }
            Err(e) => {
                op.status = OperationStatus::Failed;
                op.error = Some(e.to_string());
                BulkResult::new(Ulid::new(), op.chunks_total as usize)
            }
        };
        op.completed_at = Some(now_ms());

        if op.status == OperationStatus::Completed && op.chunks_total == 0 {
            report_progress(&self.engine, &op, observer.on_progress.as_ref());
        }
        if let Err(e) = self.engine.finish_operation(&op).await {
            error!(operation_id = %op.id, error = %e, "could not persist final state");
        }
        metrics::counter!(crate::observability::BULK_OPERATIONS_TOTAL, "status" => op.status.as_str())
            .increment(1);
        info!(
            operation_id = %op.id,
            status = op.status.as_str(),
            successful = op.successful_count,
            failed = op.failed_count,
            duration_ms = result.duration_ms,
            "bulk operation finished"
        );

        self.tokens.remove(&op.id);
        self.retain_result(op.id, result.clone());
        JobOutcome {
            operation_id: op.id,
            status: op.status,
            error: op.error,
            result,
        }
    }

    fn retain_result(&self, id: Ulid, result: BulkResult) {
        self.results.insert(id, result);
        if self.results.len() > MAX_RETAINED_RESULTS {
            // Ulids sort by creation time.
            let oldest = self.results.iter().map(|e| *e.key()).min();
            if let Some(oldest) = oldest {
                self.results.remove(&oldest);
            }
        }
    }
}

/// Publishes progress for `op` to the callback and to global subscribers.
fn report_progress(engine: &Engine, op: &BulkOperation, on_progress: Option<&ProgressCallback>) {
    let progress = Progress {
        operation_id: op.id,
        current: op.chunks_completed,
        total: op.chunks_total,
        percentage: op.percentage(),
    };
    if let Some(callback) = on_progress {
        callback(progress);
    }
    engine.notify.publish(&ChangeEvent::BulkProgress {
        operation_id: progress.operation_id,
        current: progress.current,
        total: progress.total,
        percentage: progress.percentage,
        timestamp: now_ms(),
    });
}

/// Per-job hooks: stop on cancel or deadline, persist progress after every
/// chunk.
struct JobObserver<'a> {
    engine: &'a Engine,
    op: Mutex<BulkOperation>,
    token: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    on_progress: Option<ProgressCallback>,
}

#[async_trait]
impl ChunkObserver for JobObserver<'_> {
    async fn before_chunk(&self, chunk_index: usize) -> Flow {
        if self.token.is_cancelled() {
            return Flow::Stop(StopReason::Cancelled);
        }
        if Instant::now() >= self.deadline {
            warn!(chunk = chunk_index, timeout_secs = self.timeout.as_secs(), "bulk operation timed out");
            return Flow::Stop(StopReason::TimedOut);
        }
        Flow::Continue
    }

    async fn chunk_finished(&self, progress: ChunkProgress, so_far: &BulkResult) {
        let snapshot = {
            let mut op = self.op.lock().await;
            op.chunks_completed = progress.chunk_index as u64 + 1;
            op.successful_count = so_far.successful.len() as u64;
            op.failed_count = so_far.failed.len() as u64;
            op.clone()
        };
        if let Err(e) = self.engine.save_operation(&snapshot).await {
            warn!(operation_id = %snapshot.id, error = %e, "could not persist progress");
        }
        report_progress(self.engine, &snapshot, self.on_progress.as_ref());
    }
}
