/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// Opaque identifier of a generation job.
pub type JobId = DbId;

/// Identifier of a user owned by the surrounding account system.
pub type UserId = DbId;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
