use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// No rule matched, not even the catch-all. Indicates a broken rule table.
    #[error("no mapping rule for {source_system}:{source_status}")]
    UnmappableStatus {
        source_system: String,
        source_status: String,
    },

    #[error("cannot aggregate an empty event sequence")]
    EmptyEventSequence,

    #[error("event for refill {event_refill_id} does not belong to snapshot of refill {snapshot_refill_id}")]
    SnapshotMismatch {
        snapshot_refill_id: String,
        event_refill_id: String,
    },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("invalid metrics input: {0}")]
    InvalidMetricsInput(String),

    #[error("identifier rejected for {field}: {reason}")]
    InvalidIdentifier { field: &'static str, reason: String },

    #[error("timestamp rejected for {field}: {reason}")]
    InvalidTimestamp { field: &'static str, reason: String },

    #[error("configuration error: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
