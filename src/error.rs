//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::DbError;

/// Errors surfaced by the pool and by scoped sessions.
///
/// Exhaustion and connection-establishment failures are the only failure
/// modes a caller observes from the pool itself; stale-connection handling
/// and close failures stay internal. The pool never retries a failed
/// acquire; retries are the caller's responsibility.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool stayed saturated past the acquisition deadline.
    ///
    /// Recoverable: no connection was created or leaked, and the caller may
    /// retry later.
    #[error("timed out after {waited:?} waiting for a free connection")]
    Exhausted {
        /// How long the acquire call waited before giving up.
        waited: Duration,
    },

    /// The pool has been shut down.
    #[error("pool is shut down")]
    Closed,

    /// The database refused a new physical connection.
    #[error("failed to establish a new connection")]
    Connect(#[source] DbError),

    /// An error raised by the database during a leased session.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The configuration failed validation at construction.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PoolError {
    /// Whether this error is a saturation timeout.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
