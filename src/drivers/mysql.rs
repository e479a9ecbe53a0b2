use std::mem;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use sqlx::mysql::{
    MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow,
    MySqlSslMode,
};
use sqlx::query::Query;
use sqlx::{Column, Connection, Either, Executor, Row, TypeInfo, ValueRef};

use crate::account::SslOptions;
use crate::drivers::{is_plain_name, quote_identifier, BatchResult, ResultQueue};
use crate::error::NativeError;
use crate::traits::{
    ConnectParams, NativeClient, NativeHandle, NativeResult, PreparedOutcome, StoredResult,
};
use crate::types::{RawQueryResult, SqlValue};

// Client-side error numbers of the MySQL C API.
const CR_UNKNOWN_ERROR: u32 = 2000;
const CR_SERVER_GONE_ERROR: u32 = 2006;
const CR_CANT_READ_CHARSET: u32 = 2019;
const CR_SSL_CONNECTION_ERROR: u32 = 2026;

/// MySQL / MariaDB native client backed by sqlx.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlNativeClient;

impl NativeClient for MySqlNativeClient {
    fn init(&self) -> NativeResult<Box<dyn NativeHandle>> {
        Ok(Box::new(MySqlHandle::default()))
    }
}

#[derive(Default)]
struct MySqlHandle {
    ssl: Option<SslOptions>,
    conn: Option<MySqlConnection>,
    results: ResultQueue,
}

impl MySqlHandle {
    fn connection(&mut self) -> NativeResult<&mut MySqlConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| NativeError::new(CR_SERVER_GONE_ERROR, "MySQL server has gone away"))
    }

    async fn run_simple(&mut self, sql: &str) -> NativeResult<()> {
        let conn = self.connection()?;
        conn.execute(sqlx::raw_sql(sql))
            .await
            .map(|_| ())
            .map_err(native_error)
    }

    fn connect_options(&self, params: ConnectParams<'_>) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(params.host)
            .port(params.port)
            .username(params.user)
            .password(params.password);

        if let Some(socket) = params.unix_socket {
            options = options.socket(socket);
        }

        if let Some(ssl) = &self.ssl {
            options = options
                .ssl_mode(MySqlSslMode::Required)
                .ssl_client_key(&ssl.key);
            if let Some(cert) = &ssl.certificate {
                options = options.ssl_client_cert(cert);
            }
            if let Some(ca) = &ssl.ca {
                options = options.ssl_mode(MySqlSslMode::VerifyCa).ssl_ca(ca);
            }
            let ignored = ignored_ssl_settings(ssl);
            if !ignored.is_empty() {
                tracing::warn!(
                    host = params.host,
                    settings = ?ignored,
                    "SSL settings not supported by the MySQL driver are ignored"
                );
            }
        }

        options
    }
}

/// SSL settings sqlx has no option for.
fn ignored_ssl_settings(ssl: &SslOptions) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if ssl.ca_path.is_some() {
        ignored.push("ssl_ca_path");
    }
    if ssl.cipher.is_some() {
        ignored.push("ssl_cipher");
    }
    ignored
}

#[async_trait]
impl NativeHandle for MySqlHandle {
    fn set_ssl(&mut self, ssl: &SslOptions) -> NativeResult<()> {
        if ssl.key.as_os_str().is_empty() {
            return Err(NativeError::new(
                CR_SSL_CONNECTION_ERROR,
                "SSL key path is empty",
            ));
        }
        self.ssl = Some(ssl.clone());
        Ok(())
    }

    async fn connect(&mut self, params: ConnectParams<'_>) -> NativeResult<()> {
        // sqlx always negotiates CLIENT_MULTI_STATEMENTS, so the flag needs no mapping.
        let options = self.connect_options(params);
        let conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(native_error)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn select_db(&mut self, schema: &str) -> NativeResult<()> {
        self.run_simple(&format!("USE {}", quote_identifier(schema, '`')))
            .await
    }

    async fn set_charset(&mut self, charset: &str) -> NativeResult<()> {
        if !is_plain_name(charset) {
            return Err(NativeError::new(
                CR_CANT_READ_CHARSET,
                format!("Can't initialize character set {charset}"),
            ));
        }
        self.run_simple(&format!("SET NAMES {charset}")).await
    }

    async fn set_autocommit(&mut self, enabled: bool) -> NativeResult<()> {
        let flag = if enabled { 1 } else { 0 };
        self.run_simple(&format!("SET autocommit={flag}")).await
    }

    async fn real_query(&mut self, sql: &str) -> NativeResult<()> {
        self.results.clear();
        let conn = self.connection()?;

        let mut results = Vec::new();
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        let mut failure = None;

        {
            let mut stream = conn.fetch_many(sqlx::raw_sql(sql));
            loop {
                match stream.try_next().await {
                    Ok(Some(Either::Right(row))) => {
                        if columns.is_none() {
                            columns = Some(column_names(&row));
                        }
                        match row_values(&row, Protocol::Text) {
                            Ok(values) => rows.push(values),
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    Ok(Some(Either::Left(done))) => match columns.take() {
                        Some(cols) => results.push(BatchResult::Rows(RawQueryResult::new(
                            cols,
                            mem::take(&mut rows),
                        ))),
                        None => results.push(BatchResult::Affected {
                            rows: done.rows_affected(),
                            insert_id: done.last_insert_id(),
                        }),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        failure = Some(native_error(e));
                        break;
                    }
                }
            }
        }

        // An error in the first statement fails the query itself.
        if results.is_empty() {
            if let Some(err) = failure {
                return Err(err);
            }
        }

        self.results.load(results, failure);
        Ok(())
    }

    fn store_result(&mut self) -> StoredResult {
        self.results.store_result()
    }

    async fn next_result(&mut self) -> NativeResult<bool> {
        self.results.next_result()
    }

    fn insert_id(&self) -> u64 {
        self.results.insert_id()
    }

    async fn run_prepared(&mut self, sql: &str, params: &[SqlValue]) -> NativeResult<PreparedOutcome> {
        let conn = self.connection()?;

        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value);
        }

        let mut outcome = PreparedOutcome::default();
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();

        let mut stream = conn.fetch_many(query);
        while let Some(item) = stream.try_next().await.map_err(native_error)? {
            match item {
                Either::Right(row) => {
                    if columns.is_none() {
                        columns = Some(column_names(&row));
                    }
                    rows.push(row_values(&row, Protocol::Binary)?);
                }
                Either::Left(done) => {
                    outcome.affected_rows = done.rows_affected();
                    outcome.last_insert_id = done.last_insert_id();
                }
            }
        }

        outcome.result = columns.map(|cols| RawQueryResult::new(cols, rows));
        Ok(outcome)
    }

    fn close(&mut self) {
        // Dropping the connection closes the socket.
        if self.conn.take().is_some() {
            tracing::debug!("closed MySQL session");
        }
        self.results.clear();
    }
}

/// Bind a SqlValue onto a sqlx query.
fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Int32(i) => query.bind(*i),
        SqlValue::Int64(i) => query.bind(*i),
        SqlValue::Float64(f) => query.bind(*f),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Bytes(b) => query.bind(b.clone()),
    }
}

fn column_names(row: &MySqlRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Wire format of the values in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    /// Plain queries: every value arrives as its text rendering.
    Text,
    /// Prepared statements: values arrive in their native binary encoding.
    Binary,
}

/// How the values of a column type are turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Text,
    Signed,
    Unsigned,
    Float,
    Double,
    DateTime,
    Date,
    Time,
    Bytes,
}

fn text_kind(type_name: &str) -> TextKind {
    match type_name {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => TextKind::Signed,
        "YEAR" => TextKind::Unsigned,
        name if name.ends_with(" UNSIGNED") => TextKind::Unsigned,
        "FLOAT" => TextKind::Float,
        "DOUBLE" => TextKind::Double,
        "DATETIME" | "TIMESTAMP" => TextKind::DateTime,
        "DATE" => TextKind::Date,
        "TIME" => TextKind::Time,
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => TextKind::Bytes,
        // DECIMAL travels as text in both protocols.
        _ => TextKind::Text,
    }
}

fn row_values(row: &MySqlRow, protocol: Protocol) -> NativeResult<Vec<Option<String>>> {
    (0..row.len())
        .map(|i| value_to_string(row, i, protocol))
        .collect()
}

/// Render one column of a row as text, `None` for SQL NULL.
fn value_to_string(row: &MySqlRow, index: usize, protocol: Protocol) -> NativeResult<Option<String>> {
    if row.try_get_raw(index).map_err(native_error)?.is_null() {
        return Ok(None);
    }

    let kind = text_kind(row.columns()[index].type_info().name());
    let text = match (kind, protocol) {
        // Binary columns are returned as their bytes.
        (TextKind::Bytes, _) => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        (TextKind::Text, _) | (_, Protocol::Text) => {
            row.try_get_unchecked::<&str, _>(index).map(str::to_string)
        }
        (TextKind::Signed, Protocol::Binary) => {
            row.try_get_unchecked::<i64, _>(index).map(|v| v.to_string())
        }
        (TextKind::Unsigned, Protocol::Binary) => {
            row.try_get_unchecked::<u64, _>(index).map(|v| v.to_string())
        }
        (TextKind::Float, Protocol::Binary) => {
            row.try_get_unchecked::<f32, _>(index).map(|v| v.to_string())
        }
        (TextKind::Double, Protocol::Binary) => {
            row.try_get_unchecked::<f64, _>(index).map(|v| v.to_string())
        }
        (TextKind::DateTime, Protocol::Binary) => row
            .try_get_unchecked::<NaiveDateTime, _>(index)
            .map(|v| v.to_string()),
        (TextKind::Date, Protocol::Binary) => row
            .try_get_unchecked::<NaiveDate, _>(index)
            .map(|v| v.to_string()),
        (TextKind::Time, Protocol::Binary) => row
            .try_get_unchecked::<NaiveTime, _>(index)
            .map(|v| v.to_string()),
    };
    text.map(Some).map_err(native_error)
}

fn native_error(err: sqlx::Error) -> NativeError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db
                .try_downcast_ref::<MySqlDatabaseError>()
                .map_or(CR_UNKNOWN_ERROR, |e| u32::from(e.number()));
            let native = NativeError::new(code, db.message());
            match db.code() {
                Some(state) => native.with_sqlstate(state),
                None => native,
            }
        }
        sqlx::Error::Io(_) => NativeError::new(CR_SERVER_GONE_ERROR, err.to_string()),
        sqlx::Error::Tls(_) => NativeError::new(CR_SSL_CONNECTION_ERROR, err.to_string()),
        _ => NativeError::new(CR_UNKNOWN_ERROR, err.to_string()),
    }
}
