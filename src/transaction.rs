use std::ops::{Deref, DerefMut};

use crate::connection::Connection;

/// Isolation level of a transaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    #[default]
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::RepeatableRead => "REPEATABLE READ",
            Self::ReadCommitted => "READ COMMITTED",
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// An open transaction on a connection.
///
/// The connection is reachable through `Deref` while the transaction is
/// open, so statements run inside it. A transaction dropped without
/// [`commit`](Transaction::commit) or [`rollback`](Transaction::rollback)
/// is rolled back before the next operation on the connection.
///
/// A transaction belongs to the session that opened it. If that session
/// ends, `commit` and `rollback` fail with
/// [`TransactionLost`](crate::error::ConnRsError::TransactionLost);
/// statements run after the loss went to a new session outside the
/// transaction.
#[derive(Debug)]
pub struct Transaction<'c> {
    connection: &'c mut Connection,
    level: IsolationLevel,
    consistent_snapshot: bool,
    session_id: u64,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(
        connection: &'c mut Connection,
        level: IsolationLevel,
        consistent_snapshot: bool,
    ) -> Self {
        Self {
            session_id: connection.session_id(),
            connection,
            level,
            consistent_snapshot,
            finished: false,
        }
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    pub fn consistent_snapshot(&self) -> bool {
        self.consistent_snapshot
    }

    pub async fn commit(mut self) -> bool {
        self.finish("COMMIT").await
    }

    pub async fn rollback(mut self) -> bool {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, sql: &str) -> bool {
        // The transaction is over even when the statement fails.
        self.finished = true;
        let outcome = self.connection.run_in_session(self.session_id, sql).await;
        match outcome.error {
            Some(err) => {
                self.connection.report(err);
                false
            }
            None => true,
        }
    }
}

impl Deref for Transaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &*self.connection
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut *self.connection
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // A lost session took the transaction with it.
        if !self.finished && self.connection.session_id() == self.session_id {
            tracing::warn!(
                level = self.level.as_sql(),
                "transaction dropped without commit or rollback"
            );
            self.connection.schedule_rollback();
        }
    }
}
