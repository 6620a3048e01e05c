//! Hypervisor error types.

use thiserror::Error;

pub type HypervisorResult<T> = Result<T, HypervisorError>;

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("unexpected {what} output: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("hypervisor rejected the call: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
