//! Connection pool implementation.
//!
//! The pool owns a bounded set of live connections, a counter of connections
//! currently counted against the capacity ceiling, and a semaphore that
//! provides timeout-bounded backpressure. All work happens synchronously
//! inside caller calls; there is no background task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::{ConnectOptions, PoolConfig};
use crate::error::PoolError;
use crate::lifecycle::{Connection, ConnectionFactory, ConnectionMetadata, DbError};

/// A bounded connection pool.
///
/// The pool hands out at most `max_connections` live connections, reusing
/// idle ones when possible. Every connection returned by [`Pool::acquire`]
/// either passed a liveness probe in the same call or was freshly created.
///
/// `Pool` is a cheap handle: construct it once at process startup and clone
/// it into every collaborator that needs persistence.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .connect_options(connect)
///     .min_connections(2)
///     .max_connections(10)
///     .build(MySqlFactory)
///     .await?;
///
/// let conn = pool.acquire().await?;
/// // Use connection...
/// pool.release(conn, true).await;
/// ```
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    connect: ConnectOptions,
    config: PoolConfig,

    /// Capacity gate: one permit per free connection slot. A leased
    /// connection corresponds to a forgotten permit.
    semaphore: Semaphore,

    /// Connections available for reuse, oldest first. Never locked across
    /// an await.
    idle: Mutex<VecDeque<IdleEntry<F::Conn>>>,

    /// Connections counted against the capacity ceiling (leased + idle).
    active: AtomicUsize,

    /// Whether the pool has been shut down.
    closed: AtomicBool,

    /// Counter for generating connection ids.
    next_connection_id: AtomicU64,

    metrics: MetricsInner,
}

struct IdleEntry<C> {
    conn: C,
    meta: ConnectionMetadata,
}

/// Internal metrics tracking. All counters are monotonic.
#[derive(Debug, Default)]
struct MetricsInner {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquire_calls: AtomicU64,
    acquire_timeouts: AtomicU64,
    total_wait_micros: AtomicU64,
    health_checks_performed: AtomicU64,
    health_checks_failed: AtomicU64,
    resets_performed: AtomicU64,
    resets_failed: AtomicU64,
}

impl MetricsInner {
    /// Record one acquire call and the wall-clock time it spent, regardless
    /// of which branch it returned through.
    fn record_acquire(&self, waited: Duration) {
        self.acquire_calls.fetch_add(1, Ordering::Relaxed);
        self.total_wait_micros
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    fn average_wait(&self) -> Duration {
        let calls = self.acquire_calls.load(Ordering::Relaxed);
        if calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_wait_micros.load(Ordering::Relaxed) / calls)
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a new pool and eagerly open `min_connections` connections.
    ///
    /// Fails if the configuration is invalid or if any of the eager
    /// connections cannot be established; connections opened before the
    /// failure are closed best-effort.
    pub async fn new(
        factory: F,
        connect: ConnectOptions,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        connect.validate()?;
        config.validate()?;

        let inner = Arc::new(PoolInner {
            semaphore: Semaphore::new(config.max_connections as usize),
            factory,
            connect,
            config,
            idle: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            metrics: MetricsInner::default(),
        });

        for _ in 0..inner.config.min_connections {
            match inner.open_connection().await {
                Ok(entry) => {
                    inner.active.fetch_add(1, Ordering::Relaxed);
                    inner.idle.lock().push_back(entry);
                }
                Err(e) => {
                    inner.drain_idle().await;
                    return Err(PoolError::Connect(e));
                }
            }
        }

        tracing::info!(
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            host = %inner.connect.host,
            database = %inner.connect.database,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get a connection from the pool.
    ///
    /// Returns an existing idle connection after an age check and a liveness
    /// probe, creates a new one if the pool is under capacity, or blocks
    /// until either a connection is released or `acquire_timeout` elapses.
    /// On timeout no resource is leaked; the call fails with
    /// [`PoolError::Exhausted`].
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        let start = Instant::now();
        let result = self.inner.acquire_inner().await;
        self.inner.metrics.record_acquire(start.elapsed());

        result.map(|(conn, meta)| PooledConnection {
            conn: Some(conn),
            meta,
            broken: false,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Return a leased connection to the pool.
    ///
    /// If `healthy` is false, or the connection exceeded its maximum age
    /// while leased, it is closed instead of queued, and the connection
    /// floor is replenished if needed. Never blocks on a waiter and never
    /// fails: close errors are logged and swallowed since the connection is
    /// being discarded regardless.
    ///
    /// The connection always returns to the pool it was acquired from, no
    /// matter which handle performs the release.
    pub async fn release(&self, mut leased: PooledConnection<F>, healthy: bool) {
        if let Some(conn) = leased.conn.take() {
            let healthy = healthy && !leased.broken;
            leased.inner.release(conn, leased.meta, healthy, false).await;
        }
    }

    /// Shut down the pool.
    ///
    /// Closes every currently idle connection and wakes blocked acquirers
    /// with [`PoolError::Closed`]. Connections still checked out are closed
    /// by their holder's eventual release. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        self.inner.drain_idle().await;
        tracing::info!("connection pool shut down");
    }

    /// Check if the pool has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Take a read-only snapshot of the pool metrics.
    ///
    /// Safe to call concurrently with acquire/release; never mutates state.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let idle = self.inner.idle.lock().len();
        let m = &self.inner.metrics;
        PoolMetrics {
            active: self.inner.active.load(Ordering::Relaxed),
            idle,
            connections_created: m.connections_created.load(Ordering::Relaxed),
            connections_closed: m.connections_closed.load(Ordering::Relaxed),
            acquire_calls: m.acquire_calls.load(Ordering::Relaxed),
            acquire_timeouts: m.acquire_timeouts.load(Ordering::Relaxed),
            average_wait: m.average_wait(),
            health_checks_performed: m.health_checks_performed.load(Ordering::Relaxed),
            health_checks_failed: m.health_checks_failed.load(Ordering::Relaxed),
            resets_performed: m.resets_performed.load(Ordering::Relaxed),
            resets_failed: m.resets_failed.load(Ordering::Relaxed),
        }
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Open a physical connection and stamp its metadata. Does not touch
    /// the active count; callers reserve their slot first.
    async fn open_connection(&self) -> Result<IdleEntry<F::Conn>, DbError> {
        let conn = self.factory.connect(&self.connect).await?;
        let meta = ConnectionMetadata {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
        };
        self.metrics.connections_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = meta.id, "opened database connection");
        Ok(IdleEntry { conn, meta })
    }

    /// Close a connection and release its capacity slot. Closure errors are
    /// logged, never propagated.
    async fn close_connection(&self, conn: F::Conn, meta: ConnectionMetadata) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = conn.close().await {
            tracing::warn!(connection_id = meta.id, error = %e, "error closing connection");
        }
    }

    async fn acquire_inner(&self) -> Result<(F::Conn, ConnectionMetadata), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permit =
            match tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire()).await
            {
                Ok(Ok(permit)) => permit,
                // Semaphore closed by shutdown while we were waiting.
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    self.metrics.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        waited = ?self.config.acquire_timeout,
                        "pool exhausted; acquire timed out"
                    );
                    return Err(PoolError::Exhausted {
                        waited: self.config.acquire_timeout,
                    });
                }
            };
        // The permit reserves one connection slot for the rest of this call;
        // it is handed back by release or by the failure path below.
        permit.forget();

        loop {
            let entry = {
                let mut idle = self.idle.lock();
                idle.pop_front()
            };
            let Some(IdleEntry { mut conn, meta }) = entry else {
                break;
            };

            if meta.age() > self.config.max_connection_age {
                tracing::debug!(
                    connection_id = meta.id,
                    age = ?meta.age(),
                    "discarding idle connection past max age"
                );
                self.close_connection(conn, meta).await;
                self.replenish_floor().await;
                continue;
            }

            self.metrics.health_checks_performed.fetch_add(1, Ordering::Relaxed);
            match conn.ping().await {
                Ok(()) => {
                    tracing::trace!(connection_id = meta.id, "reusing idle connection");
                    return Ok((conn, meta));
                }
                Err(e) => {
                    self.metrics.health_checks_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        connection_id = meta.id,
                        error = %e,
                        "idle connection failed liveness probe"
                    );
                    self.close_connection(conn, meta).await;
                    self.replenish_floor().await;
                }
            }
        }

        // No reusable idle connection; the permit guarantees we are under
        // capacity, so create a fresh one.
        match self.open_connection().await {
            Ok(IdleEntry { conn, meta }) => {
                self.active.fetch_add(1, Ordering::Relaxed);
                Ok((conn, meta))
            }
            Err(e) => {
                self.semaphore.add_permits(1);
                tracing::warn!(error = %e, "failed to establish a new connection");
                Err(PoolError::Connect(e))
            }
        }
    }

    /// `reset_required` forces the rollback even when `reset_on_return` is
    /// off; the drop guard sets it because a dropped lease carries no
    /// verdict on its transaction state.
    async fn release(
        &self,
        mut conn: F::Conn,
        meta: ConnectionMetadata,
        healthy: bool,
        reset_required: bool,
    ) {
        if self.closed.load(Ordering::Acquire) {
            // Lifecycle branch, not an error: the pool shut down while this
            // connection was checked out.
            tracing::debug!(connection_id = meta.id, "pool shut down; closing returned connection");
            self.close_connection(conn, meta).await;
            return;
        }

        let expired = meta.age() > self.config.max_connection_age;
        let mut reusable = healthy && !expired;

        if reusable && (reset_required || self.config.reset_on_return) {
            self.metrics.resets_performed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = conn.rollback().await {
                self.metrics.resets_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(connection_id = meta.id, error = %e, "reset on return failed");
                reusable = false;
            }
        }

        if reusable {
            // Re-check closed under the idle lock: shutdown sets the flag
            // before draining, so a push racing the drain would strand the
            // connection open in the queue of a closed pool.
            let stranded = {
                let mut idle = self.idle.lock();
                if self.closed.load(Ordering::Acquire) {
                    Some(conn)
                } else {
                    idle.push_back(IdleEntry { conn, meta });
                    None
                }
            };
            if let Some(conn) = stranded {
                tracing::debug!(
                    connection_id = meta.id,
                    "pool shut down; closing returned connection"
                );
                self.close_connection(conn, meta).await;
            } else {
                tracing::trace!(connection_id = meta.id, "connection returned to idle queue");
            }
        } else {
            if !healthy {
                tracing::warn!(connection_id = meta.id, "discarding connection reported unhealthy");
            } else if expired {
                tracing::debug!(connection_id = meta.id, "discarding returned connection past max age");
            }
            self.close_connection(conn, meta).await;
            self.replenish_floor().await;
        }

        self.semaphore.add_permits(1);
    }

    /// Keep the connection floor populated after an involuntary closure.
    /// Slots are reserved atomically so concurrent replenishers cannot
    /// overshoot the ceiling.
    async fn replenish_floor(&self) {
        let floor = self.config.min_connections as usize;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let reserved = self.active.fetch_add(1, Ordering::Relaxed);
            if reserved >= floor {
                self.active.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            match self.open_connection().await {
                Ok(entry) => {
                    let id = entry.meta.id;
                    // Same closed re-check as release: never push into the
                    // idle queue after shutdown's drain has run.
                    let stranded = {
                        let mut idle = self.idle.lock();
                        if self.closed.load(Ordering::Acquire) {
                            Some(entry)
                        } else {
                            idle.push_back(entry);
                            None
                        }
                    };
                    if let Some(entry) = stranded {
                        self.close_connection(entry.conn, entry.meta).await;
                        return;
                    }
                    tracing::debug!(connection_id = id, "replenished connection floor");
                }
                Err(e) => {
                    self.active.fetch_sub(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "failed to replenish connection floor");
                    return;
                }
            }
        }
    }

    /// Close every idle connection.
    async fn drain_idle(&self) {
        let drained: Vec<IdleEntry<F::Conn>> = {
            let mut idle = self.idle.lock();
            idle.drain(..).collect()
        };
        for entry in drained {
            self.close_connection(entry.conn, entry.meta).await;
        }
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .connect_options(connect)
///     .max_connections(10)
///     .build(MySqlFactory)
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct PoolBuilder {
    connect: ConnectOptions,
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection options.
    #[must_use]
    pub fn connect_options(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set the maximum connection age.
    #[must_use]
    pub fn max_connection_age(mut self, age: Duration) -> Self {
        self.config.max_connection_age = age;
        self
    }

    /// Enable or disable transaction reset on return.
    #[must_use]
    pub fn reset_on_return(mut self, enabled: bool) -> Self {
        self.config.reset_on_return = enabled;
        self
    }

    /// Build the pool with the given connection factory.
    pub async fn build<F: ConnectionFactory>(self, factory: F) -> Result<Pool<F>, PoolError> {
        Pool::new(factory, self.connect, self.config).await
    }
}

/// Metrics snapshot taken by [`Pool::metrics`].
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Connections currently counted against the ceiling (leased + idle).
    pub active: usize,
    /// Connections currently idle and available for reuse.
    pub idle: usize,
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Total acquire calls, successful or not.
    pub acquire_calls: u64,
    /// Acquire calls that failed with exhaustion.
    pub acquire_timeouts: u64,
    /// Average wall-clock time spent inside acquire.
    pub average_wait: Duration,
    /// Liveness probes performed on idle reuse.
    pub health_checks_performed: u64,
    /// Liveness probes that failed.
    pub health_checks_failed: u64,
    /// Transaction resets performed on return.
    pub resets_performed: u64,
    /// Transaction resets that failed.
    pub resets_failed: u64,
}

impl PoolMetrics {
    /// Calculate health check success rate (0.0 to 1.0).
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        if self.health_checks_performed == 0 {
            return 1.0;
        }
        let successful = self.health_checks_performed - self.health_checks_failed;
        successful as f64 / self.health_checks_performed as f64
    }
}

/// A connection leased from the pool.
///
/// Dereferences to the underlying connection. Dropping the guard returns the
/// connection to the pool on the current tokio runtime; prefer
/// [`Pool::release`] when the health of the connection is known, and
/// [`PooledConnection::mark_broken`] before dropping when it is not
/// reusable.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Conn>,
    meta: ConnectionMetadata,
    broken: bool,
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Get the connection metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.meta
    }

    /// Flag the connection as unusable so it is discarded instead of reused
    /// when the guard is dropped.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Detach the connection from the pool.
    ///
    /// The connection stops counting against the capacity ceiling and
    /// becomes the caller's responsibility to close. Used for interactive
    /// multi-step sequences that outlive pool management.
    #[must_use]
    pub fn detach(mut self) -> Option<F::Conn> {
        let conn = self.conn.take();
        if conn.is_some() {
            self.inner.active.fetch_sub(1, Ordering::Relaxed);
            self.inner.semaphore.add_permits(1);
            tracing::debug!(connection_id = self.meta.id, "connection detached from pool");
        }
        conn
    }

    #[allow(clippy::expect_used)] // present from acquire until release/drop
    fn conn_mut(&mut self) -> &mut F::Conn {
        self.conn.as_mut().expect("connection already released")
    }
}

impl<F: ConnectionFactory> std::ops::Deref for PooledConnection<F> {
    type Target = F::Conn;

    #[allow(clippy::expect_used)] // present from acquire until release/drop
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<F: ConnectionFactory> std::ops::DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn_mut()
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("age", &self.meta.age())
            .field("broken", &self.broken)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let meta = self.meta;
        let healthy = !self.broken;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // The transaction state of a dropped lease is unknown;
                // require a rollback before the connection can be reused.
                handle.spawn(async move {
                    inner.release(conn, meta, healthy, true).await;
                });
            }
            Err(_) => {
                // No runtime left; the process is tearing down. Account for
                // the connection and let it drop ungracefully.
                inner.active.fetch_sub(1, Ordering::Relaxed);
                inner.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_wait_arithmetic() {
        let metrics = MetricsInner::default();
        metrics.record_acquire(Duration::from_millis(10));
        metrics.record_acquire(Duration::from_millis(20));
        metrics.record_acquire(Duration::from_millis(60));
        assert_eq!(metrics.average_wait(), Duration::from_millis(30));
    }

    #[test]
    fn test_average_wait_without_calls() {
        let metrics = MetricsInner::default();
        assert_eq!(metrics.average_wait(), Duration::ZERO);
    }

    #[test]
    fn test_health_check_success_rate() {
        let metrics = PoolMetrics {
            active: 2,
            idle: 1,
            connections_created: 5,
            connections_closed: 3,
            acquire_calls: 100,
            acquire_timeouts: 2,
            average_wait: Duration::from_millis(1),
            health_checks_performed: 100,
            health_checks_failed: 5,
            resets_performed: 80,
            resets_failed: 0,
        };
        assert!((metrics.health_check_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builder_fluent() {
        let builder = PoolBuilder::new()
            .min_connections(5)
            .max_connections(50)
            .reset_on_return(false);

        assert_eq!(builder.config.min_connections, 5);
        assert_eq!(builder.config.max_connections, 50);
        assert!(!builder.config.reset_on_return);
    }
}
