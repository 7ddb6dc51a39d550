//! Hard limits applied to every request, independent of configuration.

/// Operations accepted in a single bulk request.
pub const MAX_BATCH_SIZE: usize = 100_000;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const MAX_CHUNK_SIZE: usize = 10_000;

/// Batches above this size are tracked asynchronously by default.
pub const DEFAULT_ASYNC_THRESHOLD: usize = 1_000;

pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;

pub const MAX_ROLE_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_OWNER_LEN: usize = 256;

/// A week has 168 hours; nothing can be allocated beyond that.
pub const MAX_WEEKLY_HOURS: f64 = 168.0;

/// Longest allocation date range accepted, in days (~10 years).
pub const MAX_RANGE_DAYS: i64 = 3_660;

/// Largest date shift accepted by a copy operation, in days.
pub const MAX_SHIFT_DAYS: i64 = 3_660;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 1_000;

/// Longest request line accepted by the wire codec.
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// Finished job results kept in memory for `result` lookups.
pub const MAX_RETAINED_RESULTS: usize = 256;
