//! Driver error types.

use casegrid_replicate::ReplicationError;
use thiserror::Error;

/// Errors that surface to the caller of a run.
///
/// Case-level failures never appear here; they are reflected in the
/// recorded case's message instead.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("server allocation failed: {0}")]
    Allocation(String),

    #[error("no servers could be started")]
    NoWorkersStarted,

    #[error("run already complete")]
    RunComplete,

    #[error("run stopped")]
    Stopped,

    #[error("concurrent evaluation requires {0}")]
    NotConfigured(&'static str),

    #[error("failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("case source error: {0}")]
    Source(#[from] anyhow::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;
