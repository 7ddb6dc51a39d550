use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

/// Float noise below this is not an over-allocation.
const HOURS_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Same employee, project and date range as an existing allocation.
    Overlap,
    OverAllocation,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Overlap => "overlap",
            ConflictKind::OverAllocation => "over_allocation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: Severity,
    pub employee_id: Ulid,
    pub affected_allocation_ids: Vec<Ulid>,
    /// Over-allocation: hours above capacity at the peak week.
    /// Overlap: weekly hours counted twice by the duplicate.
    pub overlap_hours: f64,
    /// Post-write utilization of weekly capacity at the peak.
    pub percentage: f64,
    /// Position of the triggering item in the caller's request.
    pub index: Option<usize>,
    /// True when policy refused the write because of this conflict.
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictResult {
    pub conflicts: Vec<Conflict>,
    pub utilization_percent: f64,
}

/// The allocation about to be written, already validated.
#[derive(Debug, Clone, Copy)]
pub struct Proposal {
    /// Set for updates so the row does not collide with its own old version.
    pub allocation_id: Option<Ulid>,
    pub project_id: Ulid,
    pub range: DateRange,
    pub allocated_hours: f64,
}

/// `>150%` critical, `>120%` high, anything else above capacity medium.
pub fn severity_for(percentage: f64) -> Severity {
    if percentage > 150.0 {
        Severity::Critical
    } else if percentage > 120.0 {
        Severity::High
    } else {
        Severity::Medium
    }
}

/// Evaluate `proposal` against the employee's current allocations.
///
/// Only active allocations whose range intersects the proposal take part.
/// Hours are weekly rates, so the check uses the peak concurrent weekly load
/// inside the proposal's range, not the sum of every overlapping row.
pub fn evaluate(proposal: &Proposal, ledger: &EmployeeLedger) -> ConflictResult {
    let mut conflicts = Vec::new();
    let mut loads = Vec::new();
    let mut affected = Vec::new();

    for existing in ledger.overlapping(&proposal.range) {
        if !existing.counts_toward_load() || Some(existing.id) == proposal.allocation_id {
            continue;
        }
        if let Some(clamped) = existing.range.intersect(&proposal.range) {
            loads.push((clamped, existing.allocated_hours));
            affected.push(existing.id);
        }
        if existing.project_id == proposal.project_id && existing.range == proposal.range {
            conflicts.push(Conflict {
                kind: ConflictKind::Overlap,
                severity: Severity::High,
                employee_id: ledger.id,
                affected_allocation_ids: with_proposal(vec![existing.id], proposal),
                overlap_hours: existing.allocated_hours.min(proposal.allocated_hours),
                percentage: 0.0,
                index: None,
                blocked: false,
            });
        }
    }

    let peak = proposal.allocated_hours + peak_weekly_load(&loads);
    // Severity is graded on the exact ratio; only the reported figure is rounded.
    let exact = utilization(peak, ledger.weekly_capacity_hours);
    let utilization_percent = round2(exact);
    for c in conflicts.iter_mut() {
        c.percentage = utilization_percent;
    }

    if peak > ledger.weekly_capacity_hours + HOURS_EPSILON {
        conflicts.push(Conflict {
            kind: ConflictKind::OverAllocation,
            severity: severity_for(exact),
            employee_id: ledger.id,
            affected_allocation_ids: with_proposal(affected, proposal),
            overlap_hours: round2(peak - ledger.weekly_capacity_hours),
            percentage: utilization_percent,
            index: None,
            blocked: false,
        });
    }

    ConflictResult {
        conflicts,
        utilization_percent,
    }
}

/// Whether policy refuses a write carrying these conflicts.
pub fn is_blocking(conflict: &Conflict, force_create: bool, block_severity: Severity) -> bool {
    !force_create && conflict.severity >= block_severity
}

impl Conflict {
    /// One-line human summary, used for warnings and error messages.
    pub fn describe(&self) -> String {
        match self.kind {
            ConflictKind::OverAllocation => format!(
                "employee {} over-allocated at {}% ({}, {}h over capacity)",
                self.employee_id,
                self.percentage,
                self.severity.as_str(),
                self.overlap_hours
            ),
            ConflictKind::Overlap => format!(
                "employee {} already has an allocation on the same project and dates ({})",
                self.employee_id,
                self.severity.as_str()
            ),
        }
    }
}

/// Sweep line over day boundaries: the largest sum of weekly hours active on
/// any single day. Each entry is an (already clamped) range and its hours.
pub fn peak_weekly_load(loads: &[(DateRange, f64)]) -> f64 {
    if loads.is_empty() {
        return 0.0;
    }

    // An allocation stops counting the day after its (inclusive) end.
    let mut events: Vec<(chrono::NaiveDate, f64)> = Vec::with_capacity(loads.len() * 2);
    for (range, hours) in loads {
        events.push((range.start, *hours));
        // No successor: the range runs to the end of the calendar.
        if let Some(after) = range.end.succ_opt() {
            events.push((after, -*hours));
        }
    }
    // Removals before additions on the same day.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut current = 0.0_f64;
    let mut peak = 0.0_f64;
    for (_, delta) in &events {
        current += delta;
        if *delta > 0.0 {
            peak = peak.max(current);
        }
    }
    peak
}

/// Unrounded load as a percentage of capacity. Capacity is always positive
/// for employees created through the engine; a zero capacity read back from
/// the log makes any load infinite.
fn utilization(peak: f64, capacity: f64) -> f64 {
    if capacity <= 0.0 {
        return if peak > 0.0 { f64::INFINITY } else { 0.0 };
    }
    peak / capacity * 100.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn with_proposal(mut ids: Vec<Ulid>, proposal: &Proposal) -> Vec<Ulid> {
    if let Some(id) = proposal.allocation_id {
        ids.push(id);
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str) -> DateRange {
        DateRange::new(d(start), d(end))
    }

    fn ledger(capacity: f64) -> EmployeeLedger {
        EmployeeLedger::new(Ulid::new(), capacity, true)
    }

    fn existing(ledger: &mut EmployeeLedger, project: Ulid, r: DateRange, hours: f64) -> Ulid {
        let id = Ulid::new();
        ledger.insert_allocation(Allocation {
            id,
            employee_id: ledger.id,
            project_id: project,
            range: r,
            allocated_hours: hours,
            role: None,
            status: AllocationStatus::Active,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        });
        id
    }

    fn proposal(project: Ulid, r: DateRange, hours: f64) -> Proposal {
        Proposal {
            allocation_id: None,
            project_id: project,
            range: r,
            allocated_hours: hours,
        }
    }

    #[test]
    fn no_existing_allocations_no_conflicts() {
        let l = ledger(40.0);
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-01", "2026-03-31"), 20.0), &l);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.utilization_percent, 50.0);
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(severity_for(125.0), Severity::High);
        assert_eq!(severity_for(155.0), Severity::Critical);
        assert_eq!(severity_for(150.0), Severity::High);
        assert_eq!(severity_for(110.0), Severity::Medium);
    }

    #[test]
    fn under_capacity_is_clean() {
        let mut l = ledger(40.0);
        existing(&mut l, Ulid::new(), range("2026-01-01", "2026-01-31"), 16.0);
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-10", "2026-01-20"), 20.0), &l);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.utilization_percent, 90.0);
    }

    #[test]
    fn over_allocation_scales_severity() {
        let mut l = ledger(40.0);
        let a = existing(&mut l, Ulid::new(), range("2026-01-01", "2026-01-31"), 30.0);

        let high = evaluate(&proposal(Ulid::new(), range("2026-01-05", "2026-01-09"), 20.0), &l);
        assert_eq!(high.conflicts.len(), 1);
        let c = &high.conflicts[0];
        assert_eq!(c.kind, ConflictKind::OverAllocation);
        assert_eq!(c.severity, Severity::High);
        assert_eq!(c.percentage, 125.0);
        assert_eq!(c.overlap_hours, 10.0);
        assert_eq!(c.affected_allocation_ids, vec![a]);

        let critical = evaluate(&proposal(Ulid::new(), range("2026-01-05", "2026-01-09"), 32.0), &l);
        assert_eq!(critical.conflicts[0].severity, Severity::Critical);
        assert_eq!(critical.conflicts[0].percentage, 155.0);
    }

    #[test]
    fn severity_graded_before_rounding() {
        let l = ledger(40.0);
        let r = range("2026-01-05", "2026-01-09");

        // 150.0025% reports as 150 but is past the critical line.
        let critical = evaluate(&proposal(Ulid::new(), r, 60.001), &l);
        assert_eq!(critical.conflicts[0].severity, Severity::Critical);
        assert_eq!(critical.conflicts[0].percentage, 150.0);
        assert!(is_blocking(&critical.conflicts[0], false, Severity::Critical));

        let high = evaluate(&proposal(Ulid::new(), r, 48.001), &l);
        assert_eq!(high.conflicts[0].severity, Severity::High);
        assert_eq!(high.conflicts[0].percentage, 120.0);

        let exact = evaluate(&proposal(Ulid::new(), r, 60.0), &l);
        assert_eq!(exact.conflicts[0].severity, Severity::High);
    }

    #[test]
    fn zero_capacity_is_always_critical() {
        let l = ledger(0.0);
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-05", "2026-01-09"), 1.0), &l);
        assert_eq!(result.conflicts[0].severity, Severity::Critical);
        assert!(result.utilization_percent.is_infinite());
    }

    #[test]
    fn long_low_hour_allocations_use_weekly_peak() {
        // Two half-year allocations that never run at the same time.
        let mut l = ledger(40.0);
        existing(&mut l, Ulid::new(), range("2026-01-01", "2026-06-30"), 20.0);
        existing(&mut l, Ulid::new(), range("2026-07-01", "2026-12-31"), 20.0);
        // A year-long 20h allocation touches both, but peaks at 40h.
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-01", "2026-12-31"), 20.0), &l);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.utilization_percent, 100.0);
    }

    #[test]
    fn adjacent_ranges_do_not_stack() {
        let mut l = ledger(40.0);
        existing(&mut l, Ulid::new(), range("2026-01-01", "2026-01-10"), 30.0);
        existing(&mut l, Ulid::new(), range("2026-01-11", "2026-01-20"), 30.0);
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-01", "2026-01-20"), 10.0), &l);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn shared_boundary_day_stacks() {
        let mut l = ledger(40.0);
        existing(&mut l, Ulid::new(), range("2026-01-01", "2026-01-10"), 30.0);
        existing(&mut l, Ulid::new(), range("2026-01-10", "2026-01-20"), 30.0);
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-10", "2026-01-10"), 1.0), &l);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.utilization_percent, 152.5);
    }

    #[test]
    fn inactive_and_finished_allocations_ignored() {
        let mut l = ledger(40.0);
        let soft_deleted = existing(&mut l, Ulid::new(), range("2026-01-01", "2026-01-31"), 40.0);
        let completed = existing(&mut l, Ulid::new(), range("2026-01-01", "2026-01-31"), 40.0);
        for a in l.allocations.iter_mut() {
            if a.id == soft_deleted {
                a.is_active = false;
            }
            if a.id == completed {
                a.status = AllocationStatus::Completed;
            }
        }
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-01", "2026-01-31"), 40.0), &l);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn identical_range_same_project_is_overlap() {
        let mut l = ledger(40.0);
        let project = Ulid::new();
        let a = existing(&mut l, project, range("2026-02-01", "2026-02-28"), 10.0);
        let result = evaluate(&proposal(project, range("2026-02-01", "2026-02-28"), 15.0), &l);
        assert_eq!(result.conflicts.len(), 1);
        let c = &result.conflicts[0];
        assert_eq!(c.kind, ConflictKind::Overlap);
        assert_eq!(c.affected_allocation_ids, vec![a]);
        assert_eq!(c.overlap_hours, 10.0);
    }

    #[test]
    fn update_excludes_its_own_row() {
        let mut l = ledger(40.0);
        let project = Ulid::new();
        let id = existing(&mut l, project, range("2026-01-01", "2026-01-31"), 20.0);
        let mut p = proposal(project, range("2026-01-01", "2026-01-31"), 50.0);
        p.allocation_id = Some(id);
        let result = evaluate(&p, &l);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].kind, ConflictKind::OverAllocation);
        assert_eq!(result.conflicts[0].percentage, 125.0);
        assert_eq!(result.conflicts[0].affected_allocation_ids, vec![id]);
    }

    #[test]
    fn blocking_policy() {
        let mut l = ledger(40.0);
        existing(&mut l, Ulid::new(), range("2026-01-01", "2026-01-31"), 40.0);
        let result = evaluate(&proposal(Ulid::new(), range("2026-01-01", "2026-01-31"), 30.0), &l);
        let c = &result.conflicts[0];
        assert_eq!(c.severity, Severity::Critical);
        assert!(is_blocking(c, false, Severity::Critical));
        assert!(!is_blocking(c, true, Severity::Critical));
    }

    #[test]
    fn peak_of_nested_ranges() {
        let loads = vec![
            (range("2026-01-01", "2026-01-31"), 10.0),
            (range("2026-01-05", "2026-01-25"), 10.0),
            (range("2026-01-10", "2026-01-12"), 10.0),
            (range("2026-01-20", "2026-01-22"), 5.0),
        ];
        assert_eq!(peak_weekly_load(&loads), 30.0);
        assert_eq!(peak_weekly_load(&[]), 0.0);
    }
}
