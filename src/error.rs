use thiserror::Error;
use tokio::io;

use crate::ai::AiError;
use crate::progress::ProgressError;
use crate::storage::StoreError;

pub type ServiceResult<T> = core::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("{0}")]
    LimitReached(String),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Progress(#[from] ProgressError),
    #[error("{0}")]
    Ai(#[from] AiError),
    #[error("{0}")]
    FromString(String),
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }
}
