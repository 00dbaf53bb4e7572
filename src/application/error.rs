use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::application::repos::{CredentialError, RepoError};
use crate::domain::error::DomainError;
use crate::infra::error::InfraError;

#[derive(Debug, Error)]
pub enum AppError {
    /// The portal positively rejected the subject's credentials. Never
    /// produced by transport trouble; only by the failure phrase.
    #[error("portal rejected the stored credentials")]
    CredentialsRejected,
    /// Transient upstream trouble that survived the whole retry budget.
    #[error("portal unavailable after {attempts} attempts: {reason}")]
    PortalUnavailable { attempts: u32, reason: String },
    #[error(transparent)]
    Store(#[from] RepoError),
    #[error("resource not found")]
    NotFound,
    #[error("pipeline deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
    /// A failure produced once and handed to every coalesced caller.
    #[error("{0}")]
    Shared(Arc<AppError>),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Failures that must reach the caller as-is. Everything else is
    /// eligible for the stale-snapshot fallback after a failed refresh.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::CredentialsRejected | Self::Store(_) => true,
            Self::Shared(inner) => inner.is_terminal(),
            _ => false,
        }
    }
}

impl From<CredentialError> for AppError {
    fn from(error: CredentialError) -> Self {
        Self::Validation(error.to_string())
    }
}
