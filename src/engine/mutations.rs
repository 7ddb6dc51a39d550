use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::ChangeEvent;

use super::store;
use super::transaction::ChunkTx;
use super::{Engine, EngineError, SharedLedger, WalCommand};

/// Hours one person can book on one day.
const MAX_DAILY_HOURS: f64 = 24.0;

impl Engine {
    // ── Reference data ───────────────────────────────────────

    pub async fn upsert_employee(
        &self,
        id: Ulid,
        weekly_capacity_hours: f64,
        is_active: bool,
    ) -> Result<(), EngineError> {
        if !weekly_capacity_hours.is_finite() || weekly_capacity_hours <= 0.0 {
            return Err(EngineError::InvalidInput(
                "weekly_capacity_hours must be greater than 0".into(),
            ));
        }
        if weekly_capacity_hours > MAX_WEEKLY_HOURS {
            return Err(EngineError::LimitExceeded("weekly_capacity_hours above 168"));
        }

        let event = Event::EmployeeUpserted {
            id,
            weekly_capacity_hours,
            is_active,
        };
        let _gate = self.commit_gate.read().await;

        if let Some(shared) = self.ledger(&id) {
            let mut guard = shared.write().await;
            if !guard.retired {
                self.wal_append(std::slice::from_ref(&event)).await?;
                guard.weekly_capacity_hours = weekly_capacity_hours;
                guard.is_active = is_active;
                return Ok(());
            }
        }

        self.wal_append(std::slice::from_ref(&event)).await?;
        let raced = match self.ledgers.entry(id) {
            Entry::Vacant(slot) => {
                let ledger = EmployeeLedger::new(id, weekly_capacity_hours, is_active);
                slot.insert(Arc::new(RwLock::new(ledger)));
                None
            }
            Entry::Occupied(existing) => Some(existing.get().clone()),
        };
        // Another upsert created it between our lookup and the WAL write.
        if let Some(shared) = raced {
            let mut guard = shared.write().await;
            guard.weekly_capacity_hours = weekly_capacity_hours;
            guard.is_active = is_active;
        }
        Ok(())
    }

    /// Remove an employee together with every allocation and time entry that
    /// references them, in one transaction. Returns the allocations removed.
    pub async fn remove_employee(&self, id: Ulid) -> Result<usize, EngineError> {
        let mut tx = ChunkTx::begin(self, BTreeSet::from([id])).await;
        let Some(ledger) = tx.ledger(&id) else {
            return Err(EngineError::NotFound(id));
        };

        let now = now_ms();
        let mut events = Vec::new();
        let mut changes = Vec::new();
        for allocation in &ledger.allocations {
            let (cascade, cascaded) = store::cascade_delete(ledger, allocation.id);
            events.extend(cascade);
            changes.push(ChangeEvent::AllocationDeleted {
                allocation_id: allocation.id,
                employee_id: id,
                project_id: allocation.project_id,
                cascaded,
                soft: false,
                timestamp: now,
            });
        }
        let removed = changes.len();
        events.push(Event::EmployeeRemoved { id });

        for event in events {
            tx.apply(event);
        }
        for change in changes {
            tx.publish(change);
        }
        tx.commit().await?;
        info!(employee_id = %id, allocations = removed, "employee removed");
        Ok(removed)
    }

    pub async fn upsert_project(
        &self,
        id: Ulid,
        name: Option<String>,
        is_active: bool,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("project name too long"));
            }
        let event = Event::ProjectUpserted { id, name, is_active };
        let _gate = self.commit_gate.read().await;
        self.wal_append(std::slice::from_ref(&event)).await?;
        self.apply_shared(&event);
        Ok(())
    }

    /// Remove a project and hard-delete every allocation on it.
    ///
    /// The project is deactivated first so no create can pass its foreign-key
    /// check while the cascade runs; then every ledger is locked and the
    /// cascade commits as one transaction.
    pub async fn remove_project(&self, id: Ulid) -> Result<usize, EngineError> {
        let project = self
            .projects
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if project.is_active {
            self.upsert_project(id, project.name, false).await?;
        }

        let everyone: BTreeSet<Ulid> = self.ledgers.iter().map(|e| *e.key()).collect();
        let mut tx = ChunkTx::begin(self, everyone).await;
        if !self.projects.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let now = now_ms();
        let mut events = Vec::new();
        let mut changes = Vec::new();
        for employee_id in tx.locked_ids() {
            let Some(ledger) = tx.ledger(employee_id) else {
                continue;
            };
            for allocation in ledger.allocations.iter().filter(|a| a.project_id == id) {
                let (cascade, cascaded) = store::cascade_delete(ledger, allocation.id);
                events.extend(cascade);
                changes.push(ChangeEvent::AllocationDeleted {
                    allocation_id: allocation.id,
                    employee_id: *employee_id,
                    project_id: id,
                    cascaded,
                    soft: false,
                    timestamp: now,
                });
            }
        }
        let removed = changes.len();
        events.push(Event::ProjectRemoved { id });

        for event in events {
            tx.apply(event);
        }
        for change in changes {
            tx.publish(change);
        }
        tx.commit().await?;
        info!(project_id = %id, allocations = removed, "project removed");
        Ok(removed)
    }

    /// Book hours against an allocation (time-tracking feed).
    pub async fn record_time_entry(
        &self,
        id: Ulid,
        allocation_id: Ulid,
        work_date: NaiveDate,
        hours: f64,
    ) -> Result<TimeEntry, EngineError> {
        if !hours.is_finite() || hours <= 0.0 || hours > MAX_DAILY_HOURS {
            return Err(EngineError::InvalidInput(format!(
                "hours must be within (0, {MAX_DAILY_HOURS}]"
            )));
        }
        let employee_id = self
            .employee_for_allocation(&allocation_id)
            .ok_or(EngineError::NotFound(allocation_id))?;

        let mut tx = ChunkTx::begin(self, BTreeSet::from([employee_id])).await;
        let allocation = tx
            .locate(&allocation_id)
            .map_err(|_| EngineError::NotFound(allocation_id))?;
        if !allocation.is_active {
            return Err(EngineError::InvalidInput(format!(
                "allocation {allocation_id} is deleted"
            )));
        }
        if !allocation.range.contains_day(work_date) {
            return Err(EngineError::InvalidInput(format!(
                "work_date {work_date} outside allocation range"
            )));
        }
        let entry = TimeEntry {
            id,
            allocation_id,
            employee_id: allocation.employee_id,
            work_date,
            hours,
        };
        tx.apply(Event::TimeEntryRecorded(entry.clone()));
        tx.commit().await?;
        Ok(entry)
    }

    // ── Bulk operation rows ──────────────────────────────────

    /// Persist a bulk operation row in place. Terminal rows never change and
    /// status only moves along the job state machine.
    pub async fn save_operation(&self, op: &BulkOperation) -> Result<(), EngineError> {
        self.check_transition(op)?;
        let event = Event::BulkOperationSaved(op.clone());
        let _gate = self.commit_gate.read().await;
        self.wal_append(std::slice::from_ref(&event)).await?;
        self.apply_shared(&event);
        Ok(())
    }

    /// Write the terminal row and its history record as one WAL record.
    pub async fn finish_operation(&self, op: &BulkOperation) -> Result<HistoryRecord, EngineError> {
        if !op.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: op.id,
                from: op.status,
                to: op.status,
            });
        }
        self.check_transition(op)?;
        let record = HistoryRecord::from_operation(op);
        let events = [
            Event::BulkOperationSaved(op.clone()),
            Event::HistoryAppended(record.clone()),
        ];
        let _gate = self.commit_gate.read().await;
        self.wal_append(&events).await?;
        for event in &events {
            self.apply_shared(event);
        }
        Ok(record)
    }

    fn check_transition(&self, op: &BulkOperation) -> Result<(), EngineError> {
        if let Some(stored) = self.operations.get(&op.id) {
            let from = stored.status;
            if from.is_terminal() || (from != op.status && !from.can_transition_to(op.status)) {
                return Err(EngineError::InvalidTransition {
                    id: op.id,
                    from,
                    to: op.status,
                });
            }
        }
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Holds the commit gate exclusively, so no commit lands between the
    /// snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        for p in self.projects.iter() {
            events.push(Event::ProjectUpserted {
                id: p.id,
                name: p.name.clone(),
                is_active: p.is_active,
            });
        }

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        for shared in ledgers {
            let ledger = shared.read().await;
            events.push(Event::EmployeeUpserted {
                id: ledger.id,
                weekly_capacity_hours: ledger.weekly_capacity_hours,
                is_active: ledger.is_active,
            });
            events.extend(ledger.allocations.iter().cloned().map(Event::AllocationCreated));
            events.extend(ledger.time_entries.iter().cloned().map(Event::TimeEntryRecorded));
        }

        events.extend(self.operations.iter().map(|op| Event::BulkOperationSaved(op.value().clone())));
        let mut history: Vec<HistoryRecord> = self.history.iter().map(|h| h.value().clone()).collect();
        history.sort_by_key(|h| (h.completed_at, h.operation_id));
        events.extend(history.into_iter().map(Event::HistoryAppended));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
