use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// Ledgers keyed by employee id. Replay builds one of these directly; a chunk
/// transaction holds one with working copies of the ledgers it locked.
pub type Ledgers = HashMap<Ulid, EmployeeLedger>;

/// Apply a ledger-level event. Events for employees not present in `ledgers`
/// are ignored (the caller did not lock them, or they were removed).
/// Project, index and operation-row bookkeeping lives in `Engine::apply_shared`.
pub fn apply_event(ledgers: &mut Ledgers, event: &Event) {
    match event {
        Event::EmployeeUpserted {
            id,
            weekly_capacity_hours,
            is_active,
        } => {
            let ledger = ledgers
                .entry(*id)
                .or_insert_with(|| EmployeeLedger::new(*id, *weekly_capacity_hours, *is_active));
            ledger.weekly_capacity_hours = *weekly_capacity_hours;
            ledger.is_active = *is_active;
        }
        Event::EmployeeRemoved { id } => {
            ledgers.remove(id);
        }
        Event::AllocationCreated(allocation) => {
            if let Some(ledger) = ledgers.get_mut(&allocation.employee_id) {
                ledger.insert_allocation(allocation.clone());
            }
        }
        Event::AllocationUpdated {
            previous_employee_id,
            allocation,
        } => {
            let moved = *previous_employee_id != allocation.employee_id;
            let mut carried = Vec::new();
            if let Some(prev) = ledgers.get_mut(previous_employee_id) {
                prev.remove_allocation(allocation.id);
                if moved {
                    carried = prev.take_time_entries_for(allocation.id);
                }
            }
            if let Some(ledger) = ledgers.get_mut(&allocation.employee_id) {
                ledger.insert_allocation(allocation.clone());
                for mut entry in carried {
                    entry.employee_id = allocation.employee_id;
                    ledger.time_entries.push(entry);
                }
            }
        }
        Event::AllocationDeleted { id, employee_id } => {
            if let Some(ledger) = ledgers.get_mut(employee_id) {
                ledger.remove_allocation(*id);
            }
        }
        Event::TimeEntryRecorded(entry) => {
            if let Some(ledger) = ledgers.get_mut(&entry.employee_id) {
                ledger.time_entries.push(entry.clone());
            }
        }
        Event::TimeEntryDeleted { id, employee_id, .. } => {
            if let Some(ledger) = ledgers.get_mut(employee_id) {
                ledger.time_entries.retain(|t| t.id != *id);
            }
        }
        Event::ProjectUpserted { .. }
        | Event::ProjectRemoved { .. }
        | Event::BulkOperationSaved(_)
        | Event::HistoryAppended(_) => {}
    }
}

/// Events that hard-delete `allocation` and every time entry booked on it.
/// Returns the events and the ids of the removed time entries.
pub fn cascade_delete(ledger: &EmployeeLedger, allocation_id: Ulid) -> (Vec<Event>, Vec<Ulid>) {
    let mut events = Vec::new();
    let mut cascaded = Vec::new();
    for entry in ledger.time_entries_for(allocation_id) {
        cascaded.push(entry.id);
        events.push(Event::TimeEntryDeleted {
            id: entry.id,
            allocation_id,
            employee_id: ledger.id,
        });
    }
    events.push(Event::AllocationDeleted {
        id: allocation_id,
        employee_id: ledger.id,
    });
    (events, cascaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn ledgers_with(ids: &[Ulid]) -> Ledgers {
        let mut ledgers = Ledgers::new();
        for id in ids {
            apply_event(
                &mut ledgers,
                &Event::EmployeeUpserted {
                    id: *id,
                    weekly_capacity_hours: 40.0,
                    is_active: true,
                },
            );
        }
        ledgers
    }

    fn allocation(employee_id: Ulid) -> Allocation {
        Allocation {
            id: Ulid::new(),
            employee_id,
            project_id: Ulid::new(),
            range: DateRange::new(d("2026-01-01"), d("2026-01-31")),
            allocated_hours: 10.0,
            role: None,
            status: AllocationStatus::Active,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn entry(a: &Allocation) -> TimeEntry {
        TimeEntry {
            id: Ulid::new(),
            allocation_id: a.id,
            employee_id: a.employee_id,
            work_date: d("2026-01-05"),
            hours: 6.0,
        }
    }

    #[test]
    fn upsert_updates_existing_ledger_in_place() {
        let id = Ulid::new();
        let mut ledgers = ledgers_with(&[id]);
        let a = allocation(id);
        apply_event(&mut ledgers, &Event::AllocationCreated(a.clone()));
        apply_event(
            &mut ledgers,
            &Event::EmployeeUpserted {
                id,
                weekly_capacity_hours: 32.0,
                is_active: false,
            },
        );
        let ledger = &ledgers[&id];
        assert_eq!(ledger.weekly_capacity_hours, 32.0);
        assert!(!ledger.is_active);
        assert_eq!(ledger.allocations, vec![a]);
    }

    #[test]
    fn allocation_for_unknown_employee_is_ignored() {
        let mut ledgers = Ledgers::new();
        apply_event(&mut ledgers, &Event::AllocationCreated(allocation(Ulid::new())));
        assert!(ledgers.is_empty());
    }

    #[test]
    fn moving_allocation_carries_time_entries() {
        let (from, to) = (Ulid::new(), Ulid::new());
        let mut ledgers = ledgers_with(&[from, to]);
        let a = allocation(from);
        let t = entry(&a);
        apply_event(&mut ledgers, &Event::AllocationCreated(a.clone()));
        apply_event(&mut ledgers, &Event::TimeEntryRecorded(t.clone()));

        let mut moved = a.clone();
        moved.employee_id = to;
        apply_event(
            &mut ledgers,
            &Event::AllocationUpdated {
                previous_employee_id: from,
                allocation: moved.clone(),
            },
        );

        assert!(ledgers[&from].allocations.is_empty());
        assert!(ledgers[&from].time_entries.is_empty());
        assert_eq!(ledgers[&to].allocations, vec![moved]);
        assert_eq!(ledgers[&to].time_entries.len(), 1);
        assert_eq!(ledgers[&to].time_entries[0].employee_id, to);
    }

    #[test]
    fn cascade_delete_removes_entries_and_allocation() {
        let id = Ulid::new();
        let mut ledgers = ledgers_with(&[id]);
        let a = allocation(id);
        let other = allocation(id);
        let t1 = entry(&a);
        let t2 = entry(&other);
        for e in [
            Event::AllocationCreated(a.clone()),
            Event::AllocationCreated(other.clone()),
            Event::TimeEntryRecorded(t1.clone()),
            Event::TimeEntryRecorded(t2.clone()),
        ] {
            apply_event(&mut ledgers, &e);
        }

        let (events, cascaded) = cascade_delete(&ledgers[&id], a.id);
        assert_eq!(cascaded, vec![t1.id]);
        assert_eq!(events.len(), 2);
        for e in &events {
            apply_event(&mut ledgers, e);
        }
        assert_eq!(ledgers[&id].allocations, vec![other]);
        assert_eq!(ledgers[&id].time_entries, vec![t2]);
    }

    #[test]
    fn employee_removed_drops_ledger() {
        let id = Ulid::new();
        let mut ledgers = ledgers_with(&[id]);
        apply_event(&mut ledgers, &Event::EmployeeRemoved { id });
        assert!(!ledgers.contains_key(&id));
    }
}
