use std::io;

use thiserror::Error;

/// Errors produced while normalizing a raw trace.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A record body was not a well-formed raw record.
    ///
    /// Parse failures are latched by the pipeline rather than propagated:
    /// everything accumulated before the bad record still flows through the
    /// filters, and the terminal event reports the truncation.
    #[error("malformed trace record: {0}")]
    Parse(#[from] serde_json::Error),

    /// An invariant of the raw trace was broken. These indicate bugs in the
    /// instrumented runtime (or in this crate), not bad user programs.
    #[error("invariant failure: {0}")]
    Invariant(String),

    /// The user source file could not be read.
    #[error("cannot read user source: {0}")]
    Source(#[from] io::Error),

    /// Normalization was aborted at a record boundary.
    #[error("normalization cancelled")]
    Cancelled,
}

impl TraceError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        TraceError::Invariant(msg.into())
    }
}
