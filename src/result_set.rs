use std::fmt::Display;
use std::str::FromStr;

use crate::connection::Connection;
use crate::error::{ConnRsError, Result};
use crate::types::RawQueryResult;

/// Addresses a column by zero-based position or by name.
pub trait ColumnIndex {
    fn position(&self, columns: &[String]) -> Option<usize>;

    fn describe(&self) -> String;
}

impl ColumnIndex for usize {
    fn position(&self, columns: &[String]) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }

    fn describe(&self) -> String {
        format!("#{self}")
    }
}

impl ColumnIndex for &str {
    fn position(&self, columns: &[String]) -> Option<usize> {
        columns.iter().position(|c| c.as_str() == *self)
    }

    fn describe(&self) -> String {
        (*self).to_string()
    }
}

/// Cursor over the stored result of a query.
///
/// Starts before the first row; call [`next`](ResultSet::next) to move onto it.
#[derive(Debug)]
pub struct ResultSet<'c> {
    connection: &'c Connection,
    result: RawQueryResult,
    /// `None` before the first call to `next`.
    position: Option<usize>,
}

impl<'c> ResultSet<'c> {
    pub(crate) fn new(connection: &'c Connection, result: RawQueryResult) -> Self {
        Self {
            connection,
            result,
            position: None,
        }
    }

    /// The connection that produced this result.
    pub fn connection(&self) -> &Connection {
        self.connection
    }

    /// Advance to the next row. Returns false once the rows are exhausted.
    pub fn next(&mut self) -> bool {
        let next = self.position.map_or(0, |p| p + 1);
        if next < self.result.len() {
            self.position = Some(next);
            true
        } else {
            self.position = Some(self.result.len());
            false
        }
    }

    /// Index of the current row, if the cursor is on one.
    pub fn row_index(&self) -> Option<usize> {
        self.position.filter(|&p| p < self.result.len())
    }

    /// Move the cursor onto row `index`. Returns false if there is no such row.
    pub fn set_row_index(&mut self, index: usize) -> bool {
        if index < self.result.len() {
            self.position = Some(index);
            true
        } else {
            false
        }
    }

    pub fn row_count(&self) -> usize {
        self.result.len()
    }

    pub fn column_count(&self) -> usize {
        self.result.columns.len()
    }

    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.result.columns.get(index).map(String::as_str)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.result.column_index(name)
    }

    /// Position the cursor on the only row of the result.
    /// Returns an error if the result contains zero or more than one row.
    pub fn single_row(&mut self) -> Result<()> {
        if self.result.len() != 1 {
            return Err(ConnRsError::UnexpectedRowCount {
                expected: 1,
                actual: self.result.len(),
            });
        }
        self.position = Some(0);
        Ok(())
    }

    /// Raw text of a column in the current row, `None` for SQL NULL.
    pub fn get_str<C: ColumnIndex>(&self, column: C) -> Result<Option<&str>> {
        let row = self
            .row_index()
            .map(|p| &self.result.rows[p])
            .ok_or(ConnRsError::NoCurrentRow)?;
        let index = column
            .position(&self.result.columns)
            .ok_or_else(|| ConnRsError::ColumnNotFound(column.describe()))?;
        Ok(row.get(index).and_then(|v| v.as_deref()))
    }

    pub fn is_null<C: ColumnIndex>(&self, column: C) -> Result<bool> {
        Ok(self.get_str(column)?.is_none())
    }

    /// Parse a column of the current row, `None` for SQL NULL.
    pub fn get<T, C>(&self, column: C) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
        C: ColumnIndex,
    {
        let name = column.describe();
        match self.get_str(column)? {
            Some(text) => text.parse().map(Some).map_err(|e: T::Err| ConnRsError::Decode {
                column: name,
                message: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Consume the cursor and return the stored result.
    pub fn into_raw(self) -> RawQueryResult {
        self.result
    }
}
