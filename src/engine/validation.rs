use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::outcome::OperationError;

/// A create after parsing: ids resolved, range ordered, hours bounded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAllocation {
    pub employee_id: Ulid,
    pub project_id: Ulid,
    pub range: DateRange,
    pub allocated_hours: f64,
    pub role: Option<String>,
    pub status: AllocationStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub employee_id: Option<Ulid>,
    pub project_id: Option<Ulid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub allocated_hours: Option<f64>,
    pub role: Option<String>,
    pub status: Option<AllocationStatus>,
}

impl Patch {
    /// Apply onto `current`. The merged range is re-checked because only one
    /// end may have changed.
    pub fn merge(&self, current: &Allocation, now: Ms) -> Result<Allocation, OperationError> {
        let start = self.start_date.unwrap_or(current.range.start);
        let end = self.end_date.unwrap_or(current.range.end);
        let range = checked_range(start, end)?;
        Ok(Allocation {
            id: current.id,
            employee_id: self.employee_id.unwrap_or(current.employee_id),
            project_id: self.project_id.unwrap_or(current.project_id),
            range,
            allocated_hours: self.allocated_hours.unwrap_or(current.allocated_hours),
            role: self.role.clone().or_else(|| current.role.clone()),
            status: self.status.unwrap_or(current.status),
            is_active: current.is_active,
            created_at: current.created_at,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create(NewAllocation),
    Update { id: Ulid, patch: Patch },
    Delete { id: Ulid },
    Copy {
        source_id: Ulid,
        shift_days: i64,
        target_project_id: Option<Ulid>,
        target_employee_id: Option<Ulid>,
    },
}

/// Stateless checks: id formats, dates, hours, lengths. Nothing here looks at
/// the store.
pub fn validate_request(request: &OperationRequest) -> Result<Operation, OperationError> {
    match request {
        OperationRequest::Create(input) => validate_create(input).map(Operation::Create),
        OperationRequest::Update(item) => validate_update(item),
        OperationRequest::Delete { id } => Ok(Operation::Delete {
            id: parse_ulid("id", id)?,
        }),
        OperationRequest::Copy(item) => validate_copy(item),
    }
}

pub fn validate_create(input: &AllocationInput) -> Result<NewAllocation, OperationError> {
    let employee_id = parse_ulid("employee_id", &input.employee_id)?;
    let project_id = parse_ulid("project_id", &input.project_id)?;
    let start = parse_date("start_date", &input.start_date)?;
    let end = parse_date("end_date", &input.end_date)?;
    let range = checked_range(start, end)?;
    check_hours(input.allocated_hours)?;
    check_role(input.role.as_deref())?;
    Ok(NewAllocation {
        employee_id,
        project_id,
        range,
        allocated_hours: input.allocated_hours,
        role: input.role.clone(),
        status: input.status.unwrap_or(AllocationStatus::Active),
    })
}

fn validate_update(item: &UpdateItem) -> Result<Operation, OperationError> {
    let id = parse_ulid("id", &item.id)?;
    let u = &item.updates;
    let patch = Patch {
        employee_id: u
            .employee_id
            .as_deref()
            .map(|raw| parse_ulid("employee_id", raw))
            .transpose()?,
        project_id: u
            .project_id
            .as_deref()
            .map(|raw| parse_ulid("project_id", raw))
            .transpose()?,
        start_date: u
            .start_date
            .as_deref()
            .map(|raw| parse_date("start_date", raw))
            .transpose()?,
        end_date: u
            .end_date
            .as_deref()
            .map(|raw| parse_date("end_date", raw))
            .transpose()?,
        allocated_hours: u.allocated_hours,
        role: u.role.clone(),
        status: u.status,
    };
    if patch == Patch::default() {
        return Err(OperationError::validation("updates", "no fields to update"));
    }
    if let Some(hours) = patch.allocated_hours {
        check_hours(hours)?;
    }
    check_role(patch.role.as_deref())?;
    if let (Some(start), Some(end)) = (patch.start_date, patch.end_date) {
        checked_range(start, end)?;
    }
    Ok(Operation::Update { id, patch })
}

fn validate_copy(item: &CopyItem) -> Result<Operation, OperationError> {
    let source_id = parse_ulid("source_id", &item.source_id)?;
    if item.shift_days.abs() > MAX_SHIFT_DAYS {
        return Err(OperationError::validation(
            "shift_days",
            format!("shift_days must be within ±{MAX_SHIFT_DAYS}"),
        ));
    }
    Ok(Operation::Copy {
        source_id,
        shift_days: item.shift_days,
        target_project_id: item
            .target_project_id
            .as_deref()
            .map(|raw| parse_ulid("target_project_id", raw))
            .transpose()?,
        target_employee_id: item
            .target_employee_id
            .as_deref()
            .map(|raw| parse_ulid("target_employee_id", raw))
            .transpose()?,
    })
}

pub fn checked_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, OperationError> {
    let range = DateRange::try_new(start, end)
        .ok_or_else(|| OperationError::validation("end_date", "end_date must not be before start_date"))?;
    if range.days() > MAX_RANGE_DAYS {
        return Err(OperationError::validation(
            "end_date",
            format!("date range longer than {MAX_RANGE_DAYS} days"),
        ));
    }
    Ok(range)
}

fn check_hours(hours: f64) -> Result<(), OperationError> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(OperationError::validation(
            "allocated_hours",
            "allocated_hours must be greater than 0",
        ));
    }
    if hours > MAX_WEEKLY_HOURS {
        return Err(OperationError::validation(
            "allocated_hours",
            format!("allocated_hours cannot exceed {MAX_WEEKLY_HOURS} per week"),
        ));
    }
    Ok(())
}

fn check_role(role: Option<&str>) -> Result<(), OperationError> {
    if let Some(r) = role
        && r.len() > MAX_ROLE_LEN {
            return Err(OperationError::validation("role", "role too long"));
        }
    Ok(())
}

fn parse_ulid(field: &'static str, raw: &str) -> Result<Ulid, OperationError> {
    Ulid::from_string(raw.trim())
        .map_err(|_| OperationError::validation(field, format!("invalid id: {raw:?}")))
}

fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, OperationError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| OperationError::validation(field, format!("invalid date: {raw:?}, expected YYYY-MM-DD")))
}

/// The raw item echoed back in `failed[].data`.
pub fn item_data(request: &OperationRequest) -> serde_json::Value {
    let value = match request {
        OperationRequest::Create(input) => serde_json::to_value(input),
        OperationRequest::Update(item) => serde_json::to_value(item),
        OperationRequest::Delete { id } => return serde_json::json!({ "id": id }),
        OperationRequest::Copy(item) => serde_json::to_value(item),
    };
    value.unwrap_or(serde_json::Value::Null)
}
