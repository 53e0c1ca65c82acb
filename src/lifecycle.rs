//! The database boundary: connection traits, error taxonomy, and metadata.
//!
//! The pool treats the database's client protocol as opaque. Everything it
//! needs from a connection is captured by [`Connection`], and everything it
//! needs to open one by [`ConnectionFactory`]. The `mysql` feature provides
//! implementations backed by `sqlx`; tests substitute in-memory mocks.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::ConnectOptions;

/// Errors surfaced by a live database connection or during establishment.
///
/// The split matters to the pool: a [`DbError::Query`] leaves the connection
/// reusable, while a [`DbError::ConnectionLost`] means it must be discarded
/// rather than returned to the idle queue.
#[derive(Debug, Error)]
pub enum DbError {
    /// The statement failed but the connection itself is intact
    /// (constraint violation, syntax error, missing table).
    #[error("query failed: {0}")]
    Query(String),

    /// The server rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The connection is unusable (network drop, protocol desync).
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl DbError {
    /// Whether the connection that produced this error must be discarded.
    #[must_use]
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

/// One live database connection, used by exactly one lease at a time.
///
/// Exclusive use is enforced by the pool's bookkeeping, never by locking the
/// connection itself. `close` consumes the connection, so it can only run
/// once per connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Lightweight liveness probe. Must reliably distinguish a live
    /// connection from a dead one.
    async fn ping(&mut self) -> Result<(), DbError>;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError>;

    /// Begin a transaction.
    async fn begin(&mut self) -> Result<(), DbError>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<(), DbError>;

    /// Roll back the current transaction. Rolling back with no transaction
    /// open must be harmless.
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Close the connection gracefully.
    async fn close(self) -> Result<(), DbError>;
}

/// Opens physical connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type this factory produces.
    type Conn: Connection;

    /// Establish a new physical connection.
    async fn connect(&self, options: &ConnectOptions) -> Result<Self::Conn, DbError>;
}

/// Identity and age of a pooled connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMetadata {
    /// Unique id within the owning pool.
    pub id: u64,

    /// When the physical connection was established.
    pub created_at: Instant,
}

impl ConnectionMetadata {
    /// How long this connection has been alive.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
