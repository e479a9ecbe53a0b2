use crate::connection::Connection;
use crate::result_set::ResultSet;
use crate::types::SqlValue;

/// A prepared statement bound to the connection that created it.
///
/// Parameters are positional and use the placeholder syntax of the backend
/// (`?` for MySQL, `$1` for PostgreSQL). The statement is sent to the server
/// each time it runs; the native library decides whether to cache it.
#[derive(Debug)]
pub struct Statement<'c> {
    connection: &'c mut Connection,
    sql: String,
    params: Vec<SqlValue>,
}

impl<'c> Statement<'c> {
    pub(crate) fn new(connection: &'c mut Connection, sql: &str) -> Self {
        Self {
            connection,
            sql: sql.to_string(),
            params: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// Bind the parameter at zero-based `index`. Unbound parameters before it are NULL.
    pub fn set(&mut self, index: usize, value: impl Into<SqlValue>) -> &mut Self {
        if index >= self.params.len() {
            self.params.resize(index + 1, SqlValue::Null);
        }
        self.params[index] = value.into();
        self
    }

    /// Bind the next parameter.
    pub fn bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.params.push(value.into());
        self
    }

    /// Remove all bound parameters.
    pub fn clear(&mut self) {
        self.params.clear();
    }

    /// Run the statement and return the number of affected rows, 0 on failure.
    pub async fn execute(&mut self) -> u64 {
        let result = self.connection.prepared(&self.sql, &self.params).await;
        self.connection
            .check(result)
            .map_or(0, |outcome| outcome.affected_rows)
    }

    /// Run the statement and return the id it generated, 0 on failure.
    pub async fn insert(&mut self) -> u64 {
        let result = self.connection.prepared(&self.sql, &self.params).await;
        self.connection
            .check(result)
            .map_or(0, |outcome| outcome.last_insert_id)
    }

    /// Run the statement and buffer its rows.
    pub async fn query(&mut self) -> Option<ResultSet<'_>> {
        let result = self.connection.prepared(&self.sql, &self.params).await;
        let outcome = self.connection.check(result)?;
        Some(ResultSet::new(
            self.connection,
            outcome.result.unwrap_or_default(),
        ))
    }
}
