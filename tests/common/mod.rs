//! Shared test doubles: an in-memory connection factory that records every
//! lifecycle event and can be scripted to fail at each seam.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use ads_db_pool::{ConnectOptions, Connection, ConnectionFactory, DbError, Pool, PoolConfig};

#[derive(Default)]
pub struct FactoryState {
    /// Connections handed out so far; also the serial source.
    pub opened: AtomicU64,
    /// Connections closed so far.
    pub closed: AtomicU64,
    pub fail_connect: AtomicBool,
    pub fail_ping: AtomicBool,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    /// Lifecycle events as `serial:event` strings, in order.
    pub log: Mutex<Vec<String>>,
}

impl FactoryState {
    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

pub struct MockFactory {
    pub state: Arc<FactoryState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FactoryState::default()),
        }
    }
}

pub struct MockConn {
    pub serial: u64,
    state: Arc<FactoryState>,
}

impl MockConn {
    fn record(&self, event: &str) {
        self.state.log.lock().push(format!("{}:{event}", self.serial));
    }
}

#[async_trait]
impl Connection for MockConn {
    async fn ping(&mut self) -> Result<(), DbError> {
        self.record("ping");
        if self.state.fail_ping.load(Ordering::Relaxed) {
            return Err(DbError::ConnectionLost("ping failed".into()));
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        self.record(&format!("execute {sql}"));
        match sql {
            "fail/query" => Err(DbError::Query("duplicate key".into())),
            "fail/connection" => Err(DbError::ConnectionLost("broken pipe".into())),
            _ => Ok(1),
        }
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.record("begin");
        if self.state.fail_begin.load(Ordering::Relaxed) {
            return Err(DbError::ConnectionLost("lost before begin".into()));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.record("commit");
        if self.state.fail_commit.load(Ordering::Relaxed) {
            return Err(DbError::Query("deadlock on commit".into()));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.record("rollback");
        Ok(())
    }

    async fn close(self) -> Result<(), DbError> {
        self.record("close");
        self.state.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Conn = MockConn;

    async fn connect(&self, _options: &ConnectOptions) -> Result<MockConn, DbError> {
        if self.state.fail_connect.load(Ordering::Relaxed) {
            return Err(DbError::Auth("access denied".into()));
        }
        let serial = self.state.opened.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MockConn {
            serial,
            state: Arc::clone(&self.state),
        })
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Build a pool over a fresh scripted factory.
pub async fn pool_with(config: PoolConfig) -> (Pool<MockFactory>, Arc<FactoryState>) {
    init_tracing();
    let factory = MockFactory::new();
    let state = Arc::clone(&factory.state);
    let pool = Pool::new(factory, ConnectOptions::default(), config)
        .await
        .expect("pool construction");
    (pool, state)
}
