//! Scoped transactional sessions.
//!
//! The scoped-acquisition contract: acquire a connection, open a
//! transaction, run the caller's operation, commit on success or roll back
//! on failure, and release the connection back to the pool exactly once on
//! every exit path. Collaborators never touch the pool's queue or counters
//! directly; this entry point and [`Pool::metrics`] are their whole surface.

use futures_util::future::BoxFuture;

use crate::error::PoolError;
use crate::lifecycle::{Connection, ConnectionFactory, DbError};
use crate::pool::Pool;

impl<F: ConnectionFactory> Pool<F> {
    /// Run `op` inside a transaction on a pooled connection.
    ///
    /// Acquires a connection (pool exhaustion and connect errors propagate
    /// unchanged), begins a transaction, and invokes `op` with mutable
    /// access to the connection. On success the transaction is committed and
    /// the connection returns to the pool healthy. On any error the
    /// transaction is rolled back; the connection returns healthy for
    /// application-level errors and is discarded for connection-level
    /// faults (see [`DbError::is_connection_fault`]).
    ///
    /// If `op` panics, the lease guard still returns the connection on
    /// unwind and the pool rolls back its open transaction before reuse.
    ///
    /// For interactive multi-step work that does not fit a closure, acquire
    /// a connection directly with [`Pool::acquire`] and manage the
    /// transaction yourself.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let spend = pool
    ///     .with_session(|conn| {
    ///         Box::pin(async move {
    ///             conn.execute("UPDATE ad_insights SET spend = spend + 10 WHERE ad_id = 7")
    ///                 .await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_session<T, Op>(&self, op: Op) -> Result<T, PoolError>
    where
        Op: for<'c> FnOnce(&'c mut F::Conn) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let mut leased = self.acquire().await?;

        if let Err(e) = leased.begin().await {
            tracing::warn!(error = %e, "failed to begin transaction");
            let healthy = !e.is_connection_fault();
            self.release(leased, healthy).await;
            return Err(PoolError::Db(e));
        }

        let outcome = op(&mut *leased).await;

        match outcome {
            Ok(value) => match leased.commit().await {
                Ok(()) => {
                    self.release(leased, true).await;
                    Ok(value)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "commit failed; rolling back");
                    let healthy = self.rollback_after_error(&mut leased, &e).await;
                    self.release(leased, healthy).await;
                    Err(PoolError::Db(e))
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "session operation failed; rolling back");
                let healthy = self.rollback_after_error(&mut leased, &e).await;
                self.release(leased, healthy).await;
                Err(PoolError::Db(e))
            }
        }
    }

    /// Roll back after a failed operation or commit, and classify whether
    /// the connection is still reusable.
    async fn rollback_after_error(
        &self,
        leased: &mut crate::pool::PooledConnection<F>,
        cause: &DbError,
    ) -> bool {
        if cause.is_connection_fault() {
            // The connection is already gone; a rollback would only fail.
            return false;
        }
        match leased.rollback().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "rollback failed; discarding connection");
                false
            }
        }
    }
}
