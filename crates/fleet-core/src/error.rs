use thiserror::Error;

/// Error taxonomy shared by every coordination component.
///
/// Reconciliation paths absorb `MalformedInput` and `Transient` locally;
/// state-machine paths always hand `InvalidTransition` and `Conflict` back to
/// the caller that triggered them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoordError {
    /// Stable code carried in `command.result` and `error` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::Transient(_) => "transient",
            CoordError::InvalidTransition(_) => "invalid_transition",
            CoordError::Conflict(_) => "conflict",
            CoordError::MalformedInput(_) => "malformed_input",
            CoordError::Fatal(_) => "fatal",
            CoordError::NotFound(_) => "not_found",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordError::Transient(_) | CoordError::Conflict(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected write: {0}")]
    Rejected(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
