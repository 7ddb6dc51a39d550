use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::coordinator::BulkRequest;
use crate::engine::{BulkOptions, EngineError};
use crate::model::{AllocationInput, CopyItem, UpdateItem};
use crate::notify::SubscriptionFilter;

fn yes() -> bool {
    true
}

/// One line of client input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    BulkCreate {
        allocations: Vec<AllocationInput>,
        #[serde(default)]
        options: BulkOptions,
    },
    BulkUpdate {
        updates: Vec<UpdateItem>,
        #[serde(default)]
        options: BulkOptions,
    },
    BulkDelete {
        ids: Vec<String>,
        #[serde(default)]
        options: BulkOptions,
    },
    BulkCopy {
        items: Vec<CopyItem>,
        #[serde(default)]
        options: BulkOptions,
    },
    ValidateCreate {
        allocations: Vec<AllocationInput>,
        #[serde(default)]
        options: BulkOptions,
    },
    ValidateUpdate {
        updates: Vec<UpdateItem>,
        #[serde(default)]
        options: BulkOptions,
    },
    ValidateDelete {
        ids: Vec<String>,
        #[serde(default)]
        options: BulkOptions,
    },
    ValidateCopy {
        items: Vec<CopyItem>,
        #[serde(default)]
        options: BulkOptions,
    },
    OperationStatus {
        id: Ulid,
    },
    CancelOperation {
        id: Ulid,
    },
    OperationHistory {
        #[serde(default)]
        limit: Option<usize>,
    },
    OperationResult {
        id: Ulid,
    },
    GetAllocation {
        id: Ulid,
    },
    ListAllocations {
        #[serde(default)]
        employee_id: Option<Ulid>,
        #[serde(default)]
        project_id: Option<Ulid>,
        #[serde(default)]
        include_inactive: bool,
    },
    UpsertEmployee {
        id: Ulid,
        weekly_capacity_hours: f64,
        #[serde(default = "yes")]
        is_active: bool,
    },
    RemoveEmployee {
        id: Ulid,
    },
    UpsertProject {
        id: Ulid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "yes")]
        is_active: bool,
    },
    RemoveProject {
        id: Ulid,
    },
    RecordTimeEntry {
        #[serde(default)]
        id: Option<Ulid>,
        allocation_id: Ulid,
        work_date: NaiveDate,
        hours: f64,
    },
    Subscribe {
        #[serde(default)]
        employee_id: Option<Ulid>,
        #[serde(default)]
        project_id: Option<Ulid>,
    },
}

impl Request {
    /// The bulk job this request describes, if it is a bulk or validate op.
    pub fn into_bulk(self) -> Option<BulkRequest> {
        match self {
            Request::BulkCreate { allocations, options }
            | Request::ValidateCreate { allocations, options } => {
                Some(BulkRequest::create(allocations, options))
            }
            Request::BulkUpdate { updates, options } | Request::ValidateUpdate { updates, options } => {
                Some(BulkRequest::update(updates, options))
            }
            Request::BulkDelete { ids, options } | Request::ValidateDelete { ids, options } => {
                Some(BulkRequest::delete(ids, options))
            }
            Request::BulkCopy { items, options } | Request::ValidateCopy { items, options } => {
                Some(BulkRequest::copy(items, options))
            }
            _ => None,
        }
    }

    pub fn is_validate_only(&self) -> bool {
        matches!(
            self,
            Request::ValidateCreate { .. }
                | Request::ValidateUpdate { .. }
                | Request::ValidateDelete { .. }
                | Request::ValidateCopy { .. }
        )
    }

    pub fn subscription(&self) -> Option<SubscriptionFilter> {
        match *self {
            Request::Subscribe {
                employee_id,
                project_id,
            } => Some(SubscriptionFilter {
                employee_id,
                project_id,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

/// One line of server output: `{"ok": ...}` or `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Value),
    Error(ErrorBody),
}

impl Response {
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => Response::Ok(value),
            Err(e) => Response::error("internal", e.to_string()),
        }
    }

    pub fn error(kind: &'static str, message: impl Into<String>) -> Self {
        Response::Error(ErrorBody {
            kind,
            message: message.into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::error(e.kind(), e.to_string())
    }
}
