use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::{OwnedRwLockWriteGuard, RwLockReadGuard};
use ulid::Ulid;

use crate::model::*;
use crate::notify::ChangeEvent;

use super::store::{self, Ledgers};
use super::{Engine, EngineError};

/// One atomic unit of work over a set of employee ledgers.
///
/// `begin` write-locks the ledgers in id order (so two transactions can never
/// deadlock) and copies them into `staged`. Every change is applied to the
/// copies and recorded as an event. `commit` writes all events as one WAL
/// record, swaps the copies in and publishes. Dropping the transaction without
/// committing is the rollback: the real ledgers were never touched.
pub(super) struct ChunkTx<'a> {
    engine: &'a Engine,
    guards: BTreeMap<Ulid, OwnedRwLockWriteGuard<EmployeeLedger>>,
    staged: Ledgers,
    /// allocation id -> employee id for rows this transaction moved or
    /// removed, since the shared index only changes at commit.
    relocated: HashMap<Ulid, Option<Ulid>>,
    events: Vec<Event>,
    changes: Vec<ChangeEvent>,
    // Dropped last: the gate must outlive the ledger locks.
    _gate: RwLockReadGuard<'a, ()>,
}

impl<'a> ChunkTx<'a> {
    pub async fn begin(engine: &'a Engine, employee_ids: BTreeSet<Ulid>) -> ChunkTx<'a> {
        let gate = engine.commit_gate.read().await;
        let mut guards = BTreeMap::new();
        let mut staged = Ledgers::new();
        for id in employee_ids {
            let Some(shared) = engine.ledger(&id) else {
                continue;
            };
            let guard = shared.write_owned().await;
            // Removed while we waited for the lock.
            if guard.retired {
                continue;
            }
            staged.insert(id, (*guard).clone());
            guards.insert(id, guard);
        }
        ChunkTx {
            engine,
            guards,
            staged,
            relocated: HashMap::new(),
            events: Vec::new(),
            changes: Vec::new(),
            _gate: gate,
        }
    }

    /// Staged view of a locked ledger. `None` if the employee does not exist
    /// or was not locked by this transaction.
    pub fn ledger(&self, employee_id: &Ulid) -> Option<&EmployeeLedger> {
        self.staged.get(employee_id)
    }

    pub fn locked_ids(&self) -> impl Iterator<Item = &Ulid> {
        self.guards.keys()
    }

    /// Where an allocation currently lives, seen from inside this transaction.
    pub fn locate(&self, allocation_id: &Ulid) -> Result<&Allocation, LocateError> {
        let employee_id = match self.relocated.get(allocation_id) {
            Some(Some(e)) => *e,
            Some(None) => return Err(LocateError::Missing),
            None => self
                .engine
                .allocation_index
                .get(allocation_id)
                .map(|e| *e.value())
                .ok_or(LocateError::Missing)?,
        };
        let ledger = self.staged.get(&employee_id).ok_or(LocateError::Moved)?;
        ledger.allocation(*allocation_id).ok_or(LocateError::Moved)
    }

    pub fn apply(&mut self, event: Event) {
        match &event {
            Event::AllocationCreated(a) => {
                self.relocated.insert(a.id, Some(a.employee_id));
            }
            Event::AllocationUpdated { allocation, .. } => {
                self.relocated.insert(allocation.id, Some(allocation.employee_id));
            }
            Event::AllocationDeleted { id, .. } => {
                self.relocated.insert(*id, None);
            }
            _ => {}
        }
        store::apply_event(&mut self.staged, &event);
        self.events.push(event);
    }

    /// Queue a change event; sent only if the commit succeeds.
    pub fn publish(&mut self, change: ChangeEvent) {
        self.changes.push(change);
    }

    /// Make the staged state durable and visible. On error nothing was
    /// applied and the transaction is rolled back.
    pub async fn commit(mut self) -> Result<usize, EngineError> {
        if self.events.is_empty() {
            return Ok(0);
        }
        let events = std::mem::take(&mut self.events);
        self.engine.wal_append(&events).await?;

        for (id, guard) in self.guards.iter_mut() {
            match self.staged.remove(id) {
                Some(ledger) => **guard = ledger,
                None => {
                    guard.retired = true;
                    self.engine.ledgers.remove(id);
                }
            }
        }
        for event in &events {
            self.engine.apply_shared(event);
        }

        // Release ledger locks before fan-out.
        self.guards.clear();
        for change in std::mem::take(&mut self.changes) {
            self.engine.notify.publish(&change);
        }
        Ok(events.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LocateError {
    /// No such allocation (never existed or hard-deleted).
    Missing,
    /// Indexed under an employee this transaction did not lock; another
    /// transaction moved it after the lock set was computed.
    Moved,
}
