use thiserror::Error;

/// Failure taxonomy shared by the domain logic. Store-level failures arrive
/// as `anyhow::Error` and are wrapped in `Storage`, except lost races
/// (`StaleRequest`, `DuplicateEntry`) which become `Conflict`.
#[derive(Debug, Error)]
pub enum SrmaError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Storage(anyhow::Error),
}

pub type SrmaResult<T> = Result<T, SrmaError>;

impl SrmaError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        SrmaError::Forbidden(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SrmaError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SrmaError::NotFound(what.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        SrmaError::Conflict(message.into())
    }
}

impl From<anyhow::Error> for SrmaError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(stale) = err.downcast_ref::<StaleRequest>() {
            return SrmaError::Conflict(stale.to_string());
        }
        if let Some(duplicate) = err.downcast_ref::<DuplicateEntry>() {
            return SrmaError::Conflict(duplicate.to_string());
        }
        SrmaError::Storage(err)
    }
}

/// Raised by stores when a resolution targets a request that is no longer
/// pending, so the whole commit is rolled back.
#[derive(Debug, Error)]
#[error("change request {0} is no longer pending")]
pub struct StaleRequest(pub crate::model::Id);

/// Raised by stores when an insert hits a uniqueness rule, e.g. a second
/// membership for the same user and project.
#[derive(Debug, Error)]
#[error("{0} already exists")]
pub struct DuplicateEntry(pub String);
