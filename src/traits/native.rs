use std::path::Path;

use async_trait::async_trait;

use crate::account::{Account, SslOptions};
use crate::error::NativeError;
use crate::transaction::IsolationLevel;
use crate::types::{RawQueryResult, SqlValue};

/// Result type for calls into a native client library.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Arguments of the real connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams<'a> {
    pub host: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    pub port: u16,
    pub unix_socket: Option<&'a Path>,
    /// Ask the server to accept several `;`-separated statements per query.
    pub multi_statements: bool,
}

impl<'a> ConnectParams<'a> {
    pub fn from_account(account: &'a Account) -> Self {
        Self {
            host: account.host(),
            user: account.user(),
            password: account.password(),
            port: account.port(),
            unix_socket: account.unix_socket(),
            multi_statements: true,
        }
    }
}

/// What the native library hands back for the current result of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredResult {
    /// The statement produced fields and the result was buffered.
    Rows(RawQueryResult),
    /// The statement produced no fields (UPDATE, INSERT, SET, ...).
    NoFields { affected_rows: u64 },
    /// The statement produced fields but the result could not be stored.
    Unavailable(NativeError),
}

/// Outcome of a prepared statement execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedOutcome {
    /// Present when the statement produced fields.
    pub result: Option<RawQueryResult>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

/// Entry point of a native client library.
pub trait NativeClient: Send + Sync {
    /// Allocate a fresh, unconnected handle.
    fn init(&self) -> NativeResult<Box<dyn NativeHandle>>;
}

/// One native connection handle.
///
/// Implementations mirror the call sequence of a C client library: a query
/// is submitted with [`real_query`](NativeHandle::real_query), then each
/// result of the batch is fetched with [`store_result`](NativeHandle::store_result)
/// and the batch is advanced with [`next_result`](NativeHandle::next_result).
#[async_trait]
pub trait NativeHandle: Send {
    /// Record SSL material to use for the upcoming connect.
    fn set_ssl(&mut self, ssl: &SslOptions) -> NativeResult<()>;

    async fn connect(&mut self, params: ConnectParams<'_>) -> NativeResult<()>;

    /// Live status of the session as reported by the server.
    async fn is_alive(&mut self) -> bool;

    async fn select_db(&mut self, schema: &str) -> NativeResult<()>;

    async fn set_charset(&mut self, charset: &str) -> NativeResult<()>;

    async fn set_autocommit(&mut self, enabled: bool) -> NativeResult<()>;

    /// Submit a query. Errors of the first statement are returned here;
    /// errors of later statements surface from `next_result`.
    async fn real_query(&mut self, sql: &str) -> NativeResult<()>;

    /// Take the current result of the last submitted batch.
    fn store_result(&mut self) -> StoredResult;

    /// Advance to the next result: `Ok(true)` when there is one,
    /// `Ok(false)` when the batch is exhausted.
    async fn next_result(&mut self) -> NativeResult<bool>;

    /// Id generated by the last statement for an auto-increment column.
    fn insert_id(&self) -> u64;

    async fn run_prepared(&mut self, sql: &str, params: &[SqlValue]) -> NativeResult<PreparedOutcome>;

    /// Statements that open a transaction with the given isolation level.
    fn begin_statements(&self, level: IsolationLevel, consistent_snapshot: bool) -> Vec<String> {
        let start = if consistent_snapshot {
            "START TRANSACTION WITH CONSISTENT SNAPSHOT"
        } else {
            "START TRANSACTION"
        };
        vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            start.to_string(),
        ]
    }

    /// Statement that applies one account session option.
    fn session_option_sql(&self, key: &str, value: &str) -> String {
        format!("SET OPTION {key}={value}")
    }

    /// Close the session and release everything the handle holds.
    fn close(&mut self);
}
