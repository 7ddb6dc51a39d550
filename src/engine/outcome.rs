use serde::Serialize;
use ulid::Ulid;

use crate::model::Allocation;

use super::conflict::Conflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; caught before any transaction opens.
    Validation,
    /// Foreign key, not found, limit or concurrent modification.
    Constraint,
    /// Refused by the conflict policy; see `conflicts[]` for the details.
    ConflictBlocked,
    /// Valid on its own, discarded with the rest of its chunk.
    RolledBack,
    /// The commit could not be made durable.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Constraint => "constraint",
            ErrorKind::ConflictBlocked => "conflict_blocked",
            ErrorKind::RolledBack => "rolled_back",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    pub message: String,
    /// Finer-grained constraint tag: `not_found`, `foreign_key`,
    /// `inactive`, `concurrent_modification`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl OperationError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            field: Some(field),
            message: message.into(),
            code: None,
        }
    }

    pub fn constraint(code: &'static str, field: Option<&'static str>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Constraint,
            field,
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn not_found(id: Ulid) -> Self {
        Self::constraint("not_found", Some("id"), format!("allocation {id} not found"))
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ConflictBlocked,
            field: None,
            message: message.into(),
            code: None,
        }
    }

    pub fn rolled_back() -> Self {
        Self {
            kind: ErrorKind::RolledBack,
            field: None,
            message: "chunk rolled back after another item failed".into(),
            code: None,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Storage,
            field: None,
            message: message.into(),
            code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessItem {
    /// Position in the caller's request.
    pub index: usize,
    pub allocation_id: Ulid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Allocation>,
    /// Time entries removed together with a hard-deleted allocation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cascaded: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub index: usize,
    /// The item as submitted.
    pub data: serde_json::Value,
    pub error: OperationError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Succeeded(SuccessItem),
    Failed(FailedItem),
}

impl ItemOutcome {
    pub fn index(&self) -> usize {
        match self {
            ItemOutcome::Succeeded(s) => s.index,
            ItemOutcome::Failed(f) => f.index,
        }
    }
}

/// Everything one chunk produced. Folded into the running `BulkResult` by
/// `BulkResult::absorb`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub committed: bool,
    pub items: Vec<ItemOutcome>,
    pub conflicts: Vec<Conflict>,
    /// Set when the chunk ended the job: a strict-mode failure or a storage error.
    pub abort: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkResult {
    pub successful: Vec<SuccessItem>,
    pub failed: Vec<FailedItem>,
    pub conflicts: Vec<Conflict>,
    pub total_processed: usize,
    pub transaction_id: Ulid,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
    pub chunks_total: usize,
    pub chunks_committed: usize,
}

impl BulkResult {
    pub fn new(transaction_id: Ulid, chunks_total: usize) -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
            conflicts: Vec::new(),
            total_processed: 0,
            transaction_id,
            duration_ms: 0,
            warnings: Vec::new(),
            chunks_total,
            chunks_committed: 0,
        }
    }

    /// Reducer over chunk outcomes. Item order within a chunk is preserved and
    /// chunks are absorbed in order, so both lists stay sorted by index.
    pub fn absorb(&mut self, chunk: ChunkOutcome) {
        if chunk.committed {
            self.chunks_committed += 1;
        }
        for item in chunk.items {
            match item {
                ItemOutcome::Succeeded(s) => self.successful.push(s),
                ItemOutcome::Failed(f) => self.failed.push(f),
            }
        }
        self.conflicts.extend(chunk.conflicts);
        self.total_processed = self.successful.len() + self.failed.len();
    }

    /// Failures recorded outside any chunk (pre-pass validation).
    pub fn record_failures(&mut self, failures: impl IntoIterator<Item = FailedItem>) {
        self.failed.extend(failures);
        self.failed.sort_by_key(|f| f.index);
        self.total_processed = self.successful.len() + self.failed.len();
    }

    pub fn blocked_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.blocked)
    }
}

/// Outcome of a validate-only run. Nothing is written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FailedItem>,
    pub warnings: Vec<String>,
    pub conflicts: Vec<Conflict>,
}
