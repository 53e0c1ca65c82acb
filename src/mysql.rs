//! MySQL connections via `sqlx`.
//!
//! Enabled by the `mysql` feature. [`MySqlFactory`] opens raw
//! `sqlx::MySqlConnection`s from the pool's [`ConnectOptions`];
//! [`MySqlSession`] adapts one to the [`Connection`] seam, with
//! [`MySqlSession::raw_mut`] as the escape hatch for running typed `sqlx`
//! queries inside a session.

use async_trait::async_trait;
use sqlx::Connection as _;
use sqlx::Executor as _;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};

use crate::config::ConnectOptions;
use crate::lifecycle::{Connection, ConnectionFactory, DbError};

/// A live MySQL connection adapted to the pool's connection seam.
pub struct MySqlSession {
    conn: MySqlConnection,
}

impl MySqlSession {
    /// Access the underlying `sqlx` connection for typed queries.
    pub fn raw_mut(&mut self) -> &mut MySqlConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Connection for MySqlSession {
    async fn ping(&mut self) -> Result<(), DbError> {
        self.conn.ping().await.map_err(map_sqlx_error)
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        let done = (&mut self.conn).execute(sql).await.map_err(map_sqlx_error)?;
        Ok(done.rows_affected())
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.execute("START TRANSACTION").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    async fn close(self) -> Result<(), DbError> {
        self.conn.close().await.map_err(map_sqlx_error)
    }
}

/// Opens MySQL connections for the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlFactory;

#[async_trait]
impl ConnectionFactory for MySqlFactory {
    type Conn = MySqlSession;

    async fn connect(&self, options: &ConnectOptions) -> Result<MySqlSession, DbError> {
        let mysql_options = MySqlConnectOptions::new()
            .host(&options.host)
            .port(options.port)
            .username(&options.user)
            .password(&options.password)
            .database(&options.database)
            .charset(&options.charset);

        let conn = tokio::time::timeout(
            options.connect_timeout,
            MySqlConnection::connect_with(&mysql_options),
        )
        .await
        .map_err(|_| {
            DbError::ConnectionLost(format!(
                "connect to {}:{} timed out after {:?}",
                options.host, options.port, options.connect_timeout
            ))
        })?
        .map_err(map_sqlx_error)?;

        Ok(MySqlSession { conn })
    }
}

/// Classify an `sqlx` error into the pool's taxonomy. SQLSTATE class 28
/// covers access denials; I/O, TLS, and protocol errors mean the
/// connection is unusable.
fn map_sqlx_error(e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::Database(db) => {
            if db.code().is_some_and(|code| code.starts_with("28")) {
                DbError::Auth(db.to_string())
            } else {
                DbError::Query(db.to_string())
            }
        }
        sqlx::Error::Io(e) => DbError::ConnectionLost(e.to_string()),
        sqlx::Error::Tls(e) => DbError::ConnectionLost(e.to_string()),
        sqlx::Error::Protocol(message) => DbError::ConnectionLost(message),
        other => DbError::Query(other.to_string()),
    }
}
