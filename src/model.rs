use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every instant (created/updated/started/completed).
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Closed calendar interval `[start, end]`; both days are included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Returns `None` when `end` is before `start`.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        DateRange::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Move both ends by `days` (negative moves backwards). `None` on calendar overflow.
    pub fn shift(&self, days: i64) -> Option<DateRange> {
        let step = Days::new(days.unsigned_abs());
        let (start, end) = if days >= 0 {
            (self.start.checked_add_days(step)?, self.end.checked_add_days(step)?)
        } else {
            (self.start.checked_sub_days(step)?, self.end.checked_sub_days(step)?)
        };
        Some(DateRange { start, end })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Active,
    Completed,
    Cancelled,
}

/// One employee's weekly time commitment to one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub employee_id: Ulid,
    pub project_id: Ulid,
    pub range: DateRange,
    /// Hours per week.
    pub allocated_hours: f64,
    pub role: Option<String>,
    pub status: AllocationStatus,
    /// Soft-delete flag.
    pub is_active: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Allocation {
    /// Only live, active-status allocations consume capacity.
    pub fn counts_toward_load(&self) -> bool {
        self.is_active && self.status == AllocationStatus::Active
    }
}

/// Hours booked against an allocation by the time-tracking collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Ulid,
    pub allocation_id: Ulid,
    pub employee_id: Ulid,
    pub work_date: NaiveDate,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub is_active: bool,
}

/// Everything the engine knows about one employee: capacity plus every
/// allocation and time entry referencing them. One ledger = one lock.
#[derive(Debug, Clone)]
pub struct EmployeeLedger {
    pub id: Ulid,
    pub weekly_capacity_hours: f64,
    pub is_active: bool,
    /// Sorted by `range.start`.
    pub allocations: Vec<Allocation>,
    pub time_entries: Vec<TimeEntry>,
    /// Set once the employee has been removed; a transaction that acquired the
    /// lock afterwards must treat the ledger as missing.
    pub retired: bool,
}

impl EmployeeLedger {
    pub fn new(id: Ulid, weekly_capacity_hours: f64, is_active: bool) -> Self {
        Self {
            id,
            weekly_capacity_hours,
            is_active,
            allocations: Vec::new(),
            time_entries: Vec::new(),
            retired: false,
        }
    }

    /// Insert allocation maintaining sort order by range.start.
    pub fn insert_allocation(&mut self, allocation: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&allocation.range.start, |a| a.range.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub fn remove_allocation(&mut self, id: Ulid) -> Option<Allocation> {
        let pos = self.allocations.iter().position(|a| a.id == id)?;
        Some(self.allocations.remove(pos))
    }

    pub fn allocation(&self, id: Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    /// Allocations whose range intersects `query`, active or not.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.range.start <= query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.range.end >= query.start)
    }

    pub fn time_entries_for(&self, allocation_id: Ulid) -> impl Iterator<Item = &TimeEntry> {
        self.time_entries
            .iter()
            .filter(move |t| t.allocation_id == allocation_id)
    }

    pub fn take_time_entries_for(&mut self, allocation_id: Ulid) -> Vec<TimeEntry> {
        let (taken, kept): (Vec<TimeEntry>, Vec<TimeEntry>) = std::mem::take(&mut self.time_entries)
            .into_iter()
            .partition(|t| t.allocation_id == allocation_id);
        self.time_entries = kept;
        taken
    }
}

// ── Bulk operation tracking ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkKind {
    Create,
    Update,
    Delete,
    Copy,
}

impl BulkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkKind::Create => "create",
            BulkKind::Update => "update",
            BulkKind::Delete => "delete",
            BulkKind::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// `pending -> running -> {completed | failed | cancelled}`. A pending job
    /// may also end directly (cancelled or failed before its first chunk).
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending | Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

/// Durable row tracking one bulk job. Updated in place after every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOperation {
    pub id: Ulid,
    pub kind: BulkKind,
    pub status: OperationStatus,
    pub total_records: u64,
    pub successful_count: u64,
    pub failed_count: u64,
    pub chunk_size: u64,
    pub chunks_total: u64,
    pub chunks_completed: u64,
    pub created_at: Ms,
    pub started_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub owner_id: Option<String>,
    pub error: Option<String>,
}

impl BulkOperation {
    pub fn new(
        id: Ulid,
        kind: BulkKind,
        total_records: u64,
        chunk_size: u64,
        owner_id: Option<String>,
    ) -> Self {
        let chunks_total = if chunk_size == 0 {
            0
        } else {
            total_records.div_ceil(chunk_size)
        };
        Self {
            id,
            kind,
            status: OperationStatus::Pending,
            total_records,
            successful_count: 0,
            failed_count: 0,
            chunk_size,
            chunks_total,
            chunks_completed: 0,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            owner_id,
            error: None,
        }
    }

    /// `round(chunks_completed / chunks_total * 100)`; an empty job that
    /// completed reports 100.
    pub fn percentage(&self) -> u8 {
        if self.chunks_total == 0 {
            return if self.status == OperationStatus::Completed { 100 } else { 0 };
        }
        progress_percentage(self.chunks_completed, self.chunks_total)
    }

    pub fn duration_ms(&self) -> Option<Ms> {
        Some(self.completed_at? - self.started_at.unwrap_or(self.created_at))
    }
}

pub fn progress_percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Append-only audit record written once a bulk job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub operation_id: Ulid,
    pub kind: BulkKind,
    pub status: OperationStatus,
    pub total_records: u64,
    pub successful_count: u64,
    pub failed_count: u64,
    pub duration_ms: Ms,
    pub started_at: Option<Ms>,
    pub completed_at: Ms,
    pub owner_id: Option<String>,
}

impl HistoryRecord {
    pub fn from_operation(op: &BulkOperation) -> Self {
        let completed_at = op.completed_at.unwrap_or_else(now_ms);
        Self {
            operation_id: op.id,
            kind: op.kind,
            status: op.status,
            total_records: op.total_records,
            successful_count: op.successful_count,
            failed_count: op.failed_count,
            duration_ms: completed_at - op.started_at.unwrap_or(op.created_at),
            started_at: op.started_at,
            completed_at,
            owner_id: op.owner_id.clone(),
        }
    }
}

/// WAL record payload. One committed transaction is a `Vec<Event>` written as
/// a single record, so replay sees all of it or none of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    EmployeeUpserted {
        id: Ulid,
        weekly_capacity_hours: f64,
        is_active: bool,
    },
    EmployeeRemoved {
        id: Ulid,
    },
    ProjectUpserted {
        id: Ulid,
        name: Option<String>,
        is_active: bool,
    },
    ProjectRemoved {
        id: Ulid,
    },
    AllocationCreated(Allocation),
    AllocationUpdated {
        previous_employee_id: Ulid,
        allocation: Allocation,
    },
    AllocationDeleted {
        id: Ulid,
        employee_id: Ulid,
    },
    TimeEntryRecorded(TimeEntry),
    TimeEntryDeleted {
        id: Ulid,
        allocation_id: Ulid,
        employee_id: Ulid,
    },
    BulkOperationSaved(BulkOperation),
    HistoryAppended(HistoryRecord),
}

// ── Request types ────────────────────────────────────────────────
//
// Ids and dates arrive as text so that a malformed value is reported against
// the one item that carries it instead of rejecting the whole request.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationInput {
    pub employee_id: String,
    pub project_id: String,
    pub start_date: String,
    pub end_date: String,
    pub allocated_hours: f64,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<AllocationStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationPatch {
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub allocated_hours: Option<f64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub status: Option<AllocationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateItem {
    pub id: String,
    pub updates: AllocationPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyItem {
    pub source_id: String,
    #[serde(default)]
    pub shift_days: i64,
    #[serde(default)]
    pub target_project_id: Option<String>,
    #[serde(default)]
    pub target_employee_id: Option<String>,
}

/// One raw item of a bulk request, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationRequest {
    Create(AllocationInput),
    Update(UpdateItem),
    Delete { id: String },
    Copy(CopyItem),
}

impl OperationRequest {
    pub fn kind(&self) -> BulkKind {
        match self {
            OperationRequest::Create(_) => BulkKind::Create,
            OperationRequest::Update(_) => BulkKind::Update,
            OperationRequest::Delete { .. } => BulkKind::Delete,
            OperationRequest::Copy(_) => BulkKind::Copy,
        }
    }
}
