use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, SharedLedger};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationQuery {
    #[serde(default)]
    pub employee_id: Option<Ulid>,
    #[serde(default)]
    pub project_id: Option<Ulid>,
    /// Include soft-deleted rows.
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeSummary {
    pub id: Ulid,
    pub weekly_capacity_hours: f64,
    pub is_active: bool,
    pub allocations: usize,
    pub time_entries: usize,
}

impl Engine {
    pub async fn get_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let employee_id = self.employee_for_allocation(&id).ok_or(EngineError::NotFound(id))?;
        let shared = self.ledger(&employee_id).ok_or(EngineError::NotFound(id))?;
        let guard = shared.read().await;
        guard.allocation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Current allocations matching `query`, ordered by employee then start
    /// date. This is what a subscriber re-fetches after a lag.
    pub async fn list_allocations(&self, query: &AllocationQuery) -> Vec<Allocation> {
        let ledgers: Vec<SharedLedger> = match query.employee_id {
            Some(id) => self.ledger(&id).into_iter().collect(),
            None => self.ledgers.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for shared in ledgers {
            let guard = shared.read().await;
            if guard.retired {
                continue;
            }
            out.extend(
                guard
                    .allocations
                    .iter()
                    .filter(|a| query.include_inactive || a.is_active)
                    .filter(|a| query.project_id.is_none_or(|p| a.project_id == p))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| {
            (a.employee_id, a.range.start, a.id).cmp(&(b.employee_id, b.range.start, b.id))
        });
        out
    }

    pub async fn time_entries_for(&self, allocation_id: Ulid) -> Result<Vec<TimeEntry>, EngineError> {
        let employee_id = self
            .employee_for_allocation(&allocation_id)
            .ok_or(EngineError::NotFound(allocation_id))?;
        let shared = self.ledger(&employee_id).ok_or(EngineError::NotFound(allocation_id))?;
        let guard = shared.read().await;
        Ok(guard.time_entries_for(allocation_id).cloned().collect())
    }

    pub async fn employee(&self, id: Ulid) -> Result<EmployeeSummary, EngineError> {
        let shared = self.ledger(&id).ok_or(EngineError::NotFound(id))?;
        let guard = shared.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        Ok(EmployeeSummary {
            id: guard.id,
            weekly_capacity_hours: guard.weekly_capacity_hours,
            is_active: guard.is_active,
            allocations: guard.allocations.len(),
            time_entries: guard.time_entries.len(),
        })
    }

    pub fn project(&self, id: Ulid) -> Option<ProjectInfo> {
        self.projects.get(&id).map(|p| p.value().clone())
    }

    pub fn get_operation(&self, id: Ulid) -> Option<BulkOperation> {
        self.operations.get(&id).map(|op| op.value().clone())
    }

    /// Most recent history records first.
    pub fn list_history(&self, limit: Option<usize>) -> Vec<HistoryRecord> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
        let mut records: Vec<HistoryRecord> = self.history.iter().map(|h| h.value().clone()).collect();
        records.sort_by(|a, b| {
            b.completed_at
                .cmp(&a.completed_at)
                .then(b.operation_id.cmp(&a.operation_id))
        });
        records.truncate(limit);
        records
    }
}
