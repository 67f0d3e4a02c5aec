//! Leaf error taxonomy for the funding-payout pipeline.
//!
//! Every variant here maps to one of the categories in the error handling
//! design: configurational errors fail fast before any network activity,
//! preflight errors abort the payout, and transient in-window errors are
//! absorbed by the orchestrator and never unwind past it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FunError {
    /// Invalid CLI, non-negative funding, missing credentials.
    #[error("configuration error: {0}")]
    Configurational(String),

    /// Insufficient balance, unknown symbol, filter resolution failed.
    #[error("preflight error: {0}")]
    Preflight(String),

    /// Stream stale, ack timeout, ambiguous submission failure.
    #[error("transient in-window condition: {0}")]
    TransientInWindow(String),

    /// Underlying transport failure (WS/REST), carried with its cause.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

pub type FunResult<T> = Result<T, FunError>;

impl FunError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configurational(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientInWindow(msg.into())
    }
}

impl From<anyhow::Error> for FunError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transport(e)
    }
}
