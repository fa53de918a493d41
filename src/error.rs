//! Error taxonomy shared by every orchestration operation.
//!
//! Nothing in the library is fatal to the hosting process. Facade calls return
//! `Result<_, CoreError>` for validation-class problems and store failures,
//! while per-video and per-channel problems are folded into outcome records
//! tagged with a [`FailureKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input rejected before any external invocation.
    #[error("{0}")]
    Validation(String),

    #[error("channel already subscribed: {0}")]
    DuplicateSubscription(String),

    #[error("subscription not found: {0}")]
    NotFound(String),

    /// The extraction tool could not resolve or fetch something.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Storage is broken: destination unwritable, disk full, store write failed.
    #[error("storage error: {0}")]
    Filesystem(String),
}

/// Coarse grouping used by the HTTP layer and the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Duplicate,
    NotFound,
    Extraction,
    Filesystem,
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn filesystem(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Filesystem(format!("{context}: {err}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::DuplicateSubscription(_) => ErrorKind::Duplicate,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Extraction(_) => ErrorKind::Extraction,
            Self::Filesystem(_) => ErrorKind::Filesystem,
        }
    }

    /// Duplicate and not-found are reported to callers like validation errors.
    pub fn is_validation_class(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Duplicate | ErrorKind::NotFound
        )
    }
}

/// Why a single download or channel listing did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network error, unavailable video, extractor incompatibility, timeout.
    Extraction,
    /// The destination tree could not be written.
    Filesystem,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Filesystem => "filesystem",
        }
    }
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Extraction => ErrorKind::Extraction,
            FailureKind::Filesystem => ErrorKind::Filesystem,
        }
    }
}
