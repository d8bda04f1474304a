use thiserror::Error;

/// Errors surfaced by the request pipeline, the executor and the background workers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Transport(String),

    #[error("Incorrect param count. Expected: {expected} actual: {actual}")]
    ParameterAlignment { expected: usize, actual: usize },

    #[error("{0}")]
    NotFound(String),

    #[error("invalid criteria: {0}")]
    Criteria(String),

    #[error("schedule error: {0}")]
    Schedule(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl CoreError {
    pub fn authentication_failed() -> Self {
        CoreError::Authentication("Authentication failed.".to_string())
    }

    pub fn access_denied() -> Self {
        CoreError::Authorization("Access denied.".to_string())
    }

    /// Short machine-readable category, used in logs and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Authentication(_) => "authentication",
            CoreError::Authorization(_) => "authorization",
            CoreError::Validation(_) => "validation",
            CoreError::Transport(_) => "transport",
            CoreError::ParameterAlignment { .. } => "parameter_alignment",
            CoreError::NotFound(_) => "not_found",
            CoreError::Criteria(_) => "criteria",
            CoreError::Schedule(_) => "schedule",
            CoreError::Database(_) => "database",
            CoreError::Serialization(_) => "serialization",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Internal(format!("{:#}", err))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
