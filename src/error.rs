use thiserror::Error;

/// Misuse of the registration API. Surfaced at startup and never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("cannot register stage '{stage}': pipeline is already frozen")]
    Frozen { stage: String },
    #[error("pipeline is already frozen")]
    AlreadyFrozen,
    #[error("unknown stage '{name}'. Available stages: {}", available.join(", "))]
    UnknownStage { name: String, available: Vec<String> },
    #[error("invalid parameters for stage '{stage}': {message}")]
    InvalidParameter { stage: String, message: String },
}

impl ConfigurationError {
    pub fn invalid(stage: &str, message: impl Into<String>) -> Self {
        ConfigurationError::InvalidParameter {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

/// Failure raised by a stage or by the terminal handler while a request is in flight.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage '{stage}' failed: {message}")]
    Failed { stage: String, message: String },
    #[error("endpoint failed: {0}")]
    Endpoint(String),
    #[error("invalid cookie name {name:?}")]
    InvalidCookie { name: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    pub fn failed(stage: &str, message: impl Into<String>) -> Self {
        StageError::Failed {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

/// Anything that reaches the outermost boundary of the chain unhandled.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("pipeline has not been frozen")]
    NotFrozen,
    #[error("unhandled error: {0}")]
    Unhandled(#[source] StageError),
    #[error("panic during dispatch: {0}")]
    Panicked(String),
}
