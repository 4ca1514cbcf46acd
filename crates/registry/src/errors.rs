use thiserror::Error;

use taskloop_core_types::{ErrorKind, TaskLoopError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("limit reached")]
    LimitReached,
    #[error("invalid transition")]
    InvalidTransition,
    #[error("internal error")]
    Internal,
}

impl RegistryError {
    pub fn into_task_error(self, detail: impl Into<String>) -> TaskLoopError {
        let kind = match self {
            Self::AlreadyExists => ErrorKind::DuplicateSession,
            Self::NotFound => ErrorKind::SessionNotFound,
            Self::LimitReached => ErrorKind::SessionLimit,
            Self::InvalidTransition => ErrorKind::InvalidTransition,
            Self::Internal => ErrorKind::Internal,
        };
        TaskLoopError::new(kind, format!("{}: {}", self, detail.into()))
    }
}
