use ulid::Ulid;

use crate::model::Ms;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("end_time must be after start_time (start {start}, end {end})")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("listing is already booked for the given time range (conflicts with {0})")]
    Conflict(Ulid),
    /// The user or listing service failed or did not answer in time.
    #[error("existence check failed: {0}")]
    Upstream(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(format!("booking {id}")),
            StoreError::Conflict(id) => EngineError::Conflict(id),
            StoreError::LimitExceeded(msg) => EngineError::InvalidInput(msg.to_string()),
            StoreError::WalError(msg) => EngineError::StorageFailure(msg),
        }
    }
}
