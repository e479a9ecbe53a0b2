use std::error::Error;
use std::mem;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{pin_mut, TryStreamExt};
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use uuid::Uuid;

use crate::account::SslOptions;
use crate::drivers::{is_plain_name, quote_identifier, BatchResult, ResultQueue};
use crate::error::NativeError;
use crate::traits::{
    ConnectParams, NativeClient, NativeHandle, NativeResult, PreparedOutcome, StoredResult,
};
use crate::transaction::IsolationLevel;
use crate::types::{RawQueryResult, SqlValue};

/// PostgreSQL native client implementation using tokio-postgres.
///
/// PostgreSQL has no session-wide autocommit switch and no last-insert-id;
/// `set_autocommit(false)` fails and `insert_id` is always 0 (use
/// `INSERT ... RETURNING` with a query instead). Schema selection sets the
/// `search_path`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresNativeClient;

impl NativeClient for PostgresNativeClient {
    fn init(&self) -> NativeResult<Box<dyn NativeHandle>> {
        Ok(Box::new(PostgresHandle::default()))
    }
}

#[derive(Default)]
struct PostgresHandle {
    client: Option<Client>,
    results: ResultQueue,
}

impl PostgresHandle {
    fn client(&self) -> NativeResult<&Client> {
        self.client
            .as_ref()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| NativeError::new(0, "connection closed"))
    }

    async fn run_simple(&mut self, sql: &str) -> NativeResult<()> {
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(native_error)
    }
}

#[async_trait]
impl NativeHandle for PostgresHandle {
    fn set_ssl(&mut self, _ssl: &SslOptions) -> NativeResult<()> {
        Err(NativeError::new(
            0,
            "SSL is not supported by the PostgreSQL driver",
        ))
    }

    async fn connect(&mut self, params: ConnectParams<'_>) -> NativeResult<()> {
        let mut config = Config::new();
        config
            .user(params.user)
            .password(params.password)
            .port(params.port);
        match params.unix_socket {
            #[cfg(unix)]
            Some(path) => {
                config.host_path(path);
            }
            _ => {
                config.host(params.host);
            }
        }

        let (client, connection) = config.connect(NoTls).await.map_err(native_error)?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection error");
            }
        });

        self.client = Some(client);
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        self.client().is_ok()
    }

    async fn select_db(&mut self, schema: &str) -> NativeResult<()> {
        self.run_simple(&format!(
            "SET search_path TO {}",
            quote_identifier(schema, '"')
        ))
        .await
    }

    async fn set_charset(&mut self, charset: &str) -> NativeResult<()> {
        if !is_plain_name(charset) {
            return Err(NativeError::new(0, format!("invalid encoding name: {charset}"))
                .with_sqlstate("22023"));
        }
        self.run_simple(&format!("SET client_encoding TO '{charset}'"))
            .await
    }

    async fn set_autocommit(&mut self, enabled: bool) -> NativeResult<()> {
        if enabled {
            return Ok(());
        }
        Err(NativeError::new(
            0,
            "PostgreSQL sessions cannot disable autocommit; use a transaction",
        )
        .with_sqlstate("0A000"))
    }

    async fn real_query(&mut self, sql: &str) -> NativeResult<()> {
        self.results.clear();
        let client = self.client()?;

        let mut results = Vec::new();
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        let mut failure = None;

        let stream = client.simple_query_raw(sql).await.map_err(native_error)?;
        pin_mut!(stream);
        loop {
            match stream.try_next().await {
                Ok(Some(SimpleQueryMessage::RowDescription(cols))) => {
                    columns = Some(cols.iter().map(|c| c.name().to_string()).collect());
                }
                Ok(Some(SimpleQueryMessage::Row(row))) => {
                    if columns.is_none() {
                        columns = Some(row.columns().iter().map(|c| c.name().to_string()).collect());
                    }
                    rows.push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
                }
                Ok(Some(SimpleQueryMessage::CommandComplete(count))) => match columns.take() {
                    Some(cols) => results.push(BatchResult::Rows(RawQueryResult::new(
                        cols,
                        mem::take(&mut rows),
                    ))),
                    None => results.push(BatchResult::Affected {
                        rows: count,
                        insert_id: 0,
                    }),
                },
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    failure = Some(native_error(e));
                    break;
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
        0
    }

    async fn run_prepared(&mut self, sql: &str, params: &[SqlValue]) -> NativeResult<PreparedOutcome> {
        let client = self.client()?;
        let statement = client.prepare(sql).await.map_err(native_error)?;

        // Convert SqlValue params to tokio-postgres compatible types
        let converted_params: Vec<Box<dyn ToSql + Sync + Send>> =
            params.iter().map(sql_value_to_tosql).collect();

        let param_refs: Vec<&(dyn ToSql + Sync)> = converted_params
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let stream = client
            .query_raw(&statement, param_refs)
            .await
            .map_err(native_error)?;
        pin_mut!(stream);

        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(native_error)? {
            let values = (0..row.len())
                .map(|i| row.try_get::<_, PgText>(i).map(|text| text.0))
                .collect::<Result<Vec<_>, _>>()
                .map_err(native_error)?;
            rows.push(values);
        }
        let affected_rows = stream.rows_affected().unwrap_or(rows.len() as u64);

        let result = if statement.columns().is_empty() {
            None
        } else {
            let columns = statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
            Some(RawQueryResult::new(columns, rows))
        };

        Ok(PreparedOutcome {
            result,
            affected_rows,
            last_insert_id: 0,
        })
    }

    fn begin_statements(&self, level: IsolationLevel, _consistent_snapshot: bool) -> Vec<String> {
        // Every PostgreSQL transaction reads from one snapshot from its first statement.
        vec![format!("START TRANSACTION ISOLATION LEVEL {}", level.as_sql())]
    }

    fn session_option_sql(&self, key: &str, value: &str) -> String {
        format!("SET {key} = {value}")
    }

    fn close(&mut self) {
        // Dropping the client ends the spawned connection task.
        if self.client.take().is_some() {
            tracing::debug!("closed PostgreSQL session");
        }
        self.results.clear();
    }
}

/// Convert a SqlValue to a boxed ToSql trait object.
fn sql_value_to_tosql(value: &SqlValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        SqlValue::Null => Box::new(None::<String>),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Int32(i) => Box::new(*i),
        SqlValue::Int64(i) => Box::new(*i),
        SqlValue::Float64(f) => Box::new(*f),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::Bytes(b) => Box::new(b.clone()),
    }
}

type BoxError = Box<dyn Error + Sync + Send>;

/// A column of a binary-format row rendered the way the server prints it
/// in text mode, `None` for SQL NULL.
struct PgText(Option<String>);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        value_to_text(ty, raw).map(|text| PgText(Some(text)))
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(PgText(None))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Decode `raw` as `T` when `T` accepts the column type.
fn render<'a, T, F>(ty: &Type, raw: &'a [u8], to_text: F) -> Option<Result<String, BoxError>>
where
    T: FromSql<'a>,
    F: FnOnce(T) -> String,
{
    T::accepts(ty).then(|| T::from_sql(ty, raw).map(to_text))
}

fn value_to_text(ty: &Type, raw: &[u8]) -> Result<String, BoxError> {
    if *ty == Type::NUMERIC {
        return numeric_to_text(raw);
    }
    if *ty == Type::BYTEA {
        return Ok(bytea_to_text(raw));
    }

    render(ty, raw, |v: bool| v.to_string())
        .or_else(|| render(ty, raw, |v: i8| v.to_string()))
        .or_else(|| render(ty, raw, |v: i16| v.to_string()))
        .or_else(|| render(ty, raw, |v: i32| v.to_string()))
        .or_else(|| render(ty, raw, |v: i64| v.to_string()))
        .or_else(|| render(ty, raw, |v: u32| v.to_string()))
        .or_else(|| render(ty, raw, |v: f32| v.to_string()))
        .or_else(|| render(ty, raw, |v: f64| v.to_string()))
        .or_else(|| render(ty, raw, |v: String| v))
        .or_else(|| render(ty, raw, |v: NaiveDate| v.to_string()))
        .or_else(|| render(ty, raw, |v: NaiveTime| v.to_string()))
        .or_else(|| render(ty, raw, |v: NaiveDateTime| v.to_string()))
        .or_else(|| {
            render(ty, raw, |v: DateTime<Utc>| {
                v.format("%Y-%m-%d %H:%M:%S%.f+00").to_string()
            })
        })
        .or_else(|| render(ty, raw, |v: Uuid| v.to_string()))
        .or_else(|| render(ty, raw, |v: serde_json::Value| v.to_string()))
        .unwrap_or_else(|| Err(format!("unsupported column type {ty}").into()))
}

/// PostgreSQL `bytea` hex output: `\x` followed by two digits per byte.
fn bytea_to_text(raw: &[u8]) -> String {
    let mut text = String::with_capacity(2 + raw.len() * 2);
    text.push_str("\\x");
    for byte in raw {
        text.push_str(&format!("{byte:02x}"));
    }
    text
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary `numeric` format: digit count, weight, sign and display
/// scale, then base-10000 digits, most significant first.
fn numeric_to_text(raw: &[u8]) -> Result<String, BoxError> {
    let word = |i: usize| -> Result<u16, BoxError> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric value".into())
    };

    let ndigits = usize::from(word(0)?);
    let weight = i64::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<_>, _>>()?;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digit = |index: i64| -> u16 {
        usize::try_from(index)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for index in 1..=weight {
            text.push_str(&format!("{:04}", digit(index)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut index = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(index)));
            index += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}

fn native_error(err: tokio_postgres::Error) -> NativeError {
    match err.as_db_error() {
        Some(db) => NativeError::new(0, db.message()).with_sqlstate(db.code().code()),
        None => NativeError::new(0, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&dscale.to_be_bytes());
        for digit in digits {
            raw.extend_from_slice(&digit.to_be_bytes());
        }
        raw
    }

    fn pg_epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_scalar_columns_to_text() {
        assert_eq!(value_to_text(&Type::BOOL, &[1]).unwrap(), "true");
        assert_eq!(value_to_text(&Type::INT2, &(-7i16).to_be_bytes()).unwrap(), "-7");
        assert_eq!(value_to_text(&Type::INT4, &42i32.to_be_bytes()).unwrap(), "42");
        assert_eq!(
            value_to_text(&Type::INT8, &9_000_000_000i64.to_be_bytes()).unwrap(),
            "9000000000"
        );
        assert_eq!(value_to_text(&Type::FLOAT8, &2.5f64.to_be_bytes()).unwrap(), "2.5");
        assert_eq!(value_to_text(&Type::TEXT, b"John").unwrap(), "John");
        assert_eq!(value_to_text(&Type::VARCHAR, b"Jane").unwrap(), "Jane");
    }

    #[test]
    fn test_temporal_columns_to_text() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let micros = (at - pg_epoch()).num_microseconds().unwrap();

        assert_eq!(
            value_to_text(&Type::TIMESTAMP, &micros.to_be_bytes()).unwrap(),
            "2024-01-02 03:04:05"
        );
        assert_eq!(
            value_to_text(&Type::TIMESTAMPTZ, &micros.to_be_bytes()).unwrap(),
            "2024-01-02 03:04:05+00"
        );

        let days = (at.date() - pg_epoch().date()).num_days() as i32;
        assert_eq!(
            value_to_text(&Type::DATE, &days.to_be_bytes()).unwrap(),
            "2024-01-02"
        );

        let time_micros: i64 = ((3 * 60 + 4) * 60 + 5) * 1_000_000;
        assert_eq!(
            value_to_text(&Type::TIME, &time_micros.to_be_bytes()).unwrap(),
            "03:04:05"
        );
    }

    #[test]
    fn test_uuid_json_and_bytea_to_text() {
        let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(
            value_to_text(&Type::UUID, id.as_bytes()).unwrap(),
            "67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
        assert_eq!(
            value_to_text(&Type::JSON, br#"{"a":1}"#).unwrap(),
            r#"{"a":1}"#
        );
        assert_eq!(
            value_to_text(&Type::BYTEA, &[0x01, 0xab, 0xff]).unwrap(),
            "\\x01abff"
        );
    }

    #[test]
    fn test_numeric_to_text() {
        assert_eq!(numeric_to_text(&numeric(0, 0, 1, &[12, 5000])).unwrap(), "12.5");
        assert_eq!(numeric_to_text(&numeric(-1, 0, 3, &[10])).unwrap(), "0.001");
        assert_eq!(numeric_to_text(&numeric(1, 0, 0, &[10])).unwrap(), "100000");
        assert_eq!(
            numeric_to_text(&numeric(0, NUMERIC_NEG, 2, &[3, 1400])).unwrap(),
            "-3.14"
        );
        assert_eq!(numeric_to_text(&numeric(0, 0, 0, &[])).unwrap(), "0");
        assert_eq!(numeric_to_text(&numeric(0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert!(numeric_to_text(&[0, 2, 0]).is_err());

        assert_eq!(
            value_to_text(&Type::NUMERIC, &numeric(0, 0, 2, &[7])).unwrap(),
            "7.00"
        );
    }

    #[test]
    fn test_unsupported_column_type_is_an_error() {
        let err = value_to_text(&Type::POINT, &[0; 16]).unwrap_err();
        assert!(err.to_string().contains("point"));
    }

    #[test]
    fn test_null_column() {
        assert!(PgText::from_sql_null(&Type::TIMESTAMP).unwrap().0.is_none());
        assert!(PgText::accepts(&Type::POINT));
    }

    #[tokio::test]
    async fn test_session_settings_without_server() {
        let mut handle = PostgresHandle::default();

        assert!(handle.set_autocommit(true).await.is_ok());
        let err = handle.set_autocommit(false).await.unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("0A000"));

        let err = handle.set_charset("utf8'; DROP").await.unwrap_err();
        assert_eq!(err.sqlstate.as_deref(), Some("22023"));

        assert!(handle.set_ssl(&SslOptions::new("/etc/client-key.pem")).is_err());
        assert!(!handle.is_alive().await);
        assert!(handle.select_db("public").await.is_err());
        assert_eq!(handle.insert_id(), 0);
    }

    #[test]
    fn test_transaction_and_option_statements() {
        let handle = PostgresHandle::default();
        assert_eq!(
            handle.begin_statements(IsolationLevel::Serializable, true),
            vec!["START TRANSACTION ISOLATION LEVEL SERIALIZABLE".to_string()]
        );
        assert_eq!(
            handle.session_option_sql("statement_timeout", "5000"),
            "SET statement_timeout = 5000"
        );
    }
}
