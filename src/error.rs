//! Error taxonomy for the composer service.

use strata_ipc::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ComposerError>;

#[derive(Debug, Error)]
pub enum ComposerError {
    /// Caller lacks the capability; nothing was mutated
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Unknown display, surface or client token
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("bad value: {0}")]
    BadValue(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// The transaction may not be visible yet
    #[error("timed out after {timeout_ms} ms waiting for {what}")]
    TimedOut { what: &'static str, timeout_ms: u64 },
    #[error("hardware composer degraded: {0}")]
    HardwareDegraded(#[from] HwcError),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ComposerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComposerError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ComposerError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            ComposerError::BadValue(_) => ErrorKind::BadValue,
            ComposerError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ComposerError::TimedOut { .. } => ErrorKind::TimedOut,
            ComposerError::HardwareDegraded(_) => ErrorKind::HardwareDegraded,
            ComposerError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Failures reported by the hardware composer collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HwcError {
    #[error("prepare failed on display {display}: {reason}")]
    Prepare { display: i32, reason: String },
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("no such hardware display {0}")]
    NoDisplay(i32),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Failures reported by the render engine collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("could not create rendering context: {0}")]
    Context(String),
    #[error("swap failed: {0}")]
    Swap(String),
}

impl From<RenderError> for ComposerError {
    fn from(err: RenderError) -> Self {
        ComposerError::Fatal(err.to_string())
    }
}
