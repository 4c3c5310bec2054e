//! Error taxonomy for the orchestration engine.
//!
//! Every public operation returns `Result<T, OrchestratorError>`. The kind of
//! the innermost structured error is preserved unchanged as context is added
//! on the way up the call stack.

use thiserror::Error;

/// Coarse classification surfaced to callers alongside the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidInput,
    Conflict,
    Internal,
}

/// Errors produced by the run orchestration engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Prefix the message with operation context, keeping the kind intact.
    pub fn context(self, ctx: impl AsRef<str>) -> Self {
        let ctx = ctx.as_ref();
        match self {
            Self::NotFound(msg) => Self::NotFound(format!("{ctx}: {msg}")),
            Self::Forbidden(msg) => Self::Forbidden(format!("{ctx}: {msg}")),
            Self::InvalidInput(msg) => Self::InvalidInput(format!("{ctx}: {msg}")),
            Self::Conflict(msg) => Self::Conflict(format!("{ctx}: {msg}")),
            Self::Internal(err) => Self::Internal(err.context(ctx.to_string())),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(msg.into()))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Extension for adding operation context without disturbing the error kind.
pub trait ResultExt<T> {
    fn op_context(self, ctx: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn op_context(self, ctx: &str) -> Result<T> {
        self.map_err(|err| err.context(ctx))
    }
}
