/// Job and task identities are time-ordered UUIDs (v7).
pub type JobId = uuid::Uuid;

/// Execution and archive tasks share the identity space of jobs.
pub type TaskId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a new time-ordered identity.
pub fn new_id() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
