use std::fmt;
use std::sync::Arc;

use crate::account::Account;
use crate::error::{ConnRsError, Result};
use crate::result_set::ResultSet;
use crate::statement::Statement;
use crate::traits::{ConnectParams, NativeClient, NativeHandle, PreparedOutcome, StoredResult};
use crate::transaction::{IsolationLevel, Transaction};
use crate::types::{RawQueryResult, SqlValue};

/// Callback invoked with every failure reported by a connection.
pub type ErrorHandler = Arc<dyn Fn(&ConnRsError) + Send + Sync>;

/// Session settings cached from the last successful native call.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionState {
    schema: Option<String>,
    charset: Option<String>,
    auto_commit: bool,
}

impl Default for SessionState {
    // A fresh native session has autocommit on and nothing selected.
    fn default() -> Self {
        Self {
            schema: None,
            charset: None,
            auto_commit: true,
        }
    }
}

impl SessionState {
    /// State the next session will have once the account settings are applied.
    fn pending(account: &Account) -> Self {
        Self {
            auto_commit: account.auto_commit(),
            ..Self::default()
        }
    }
}

/// Affected rows of a batch plus the failure that stopped it, if any.
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub(crate) affected_rows: u64,
    pub(crate) error: Option<ConnRsError>,
}

impl BatchOutcome {
    fn failed(error: ConnRsError) -> Self {
        Self {
            affected_rows: 0,
            error: Some(error),
        }
    }

    fn into_result(self) -> Result<u64> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.affected_rows),
        }
    }
}

/// One connection to a database server through a native client library.
///
/// The native handle is created on the first operation that needs it and
/// re-created on a later operation if the session was lost. Operations
/// return a sentinel on failure (`false`, `0` or `None`); the error itself is
/// logged through `tracing`, passed to the error handler and kept as
/// [`last_error`](Connection::last_error).
///
/// # Example
/// ```ignore
/// use std::sync::Arc;
/// use connrs::{Account, Connection};
/// use connrs::drivers::MySqlNativeClient;
///
/// let account = Arc::new(Account::from_url("mysql://root@localhost/test")?);
/// let mut conn = Connection::create(account, Arc::new(MySqlNativeClient));
///
/// let affected = conn.execute("UPDATE users SET active = 1; UPDATE groups SET active = 1").await;
/// if let Some(mut rs) = conn.query("SELECT id, name FROM users").await {
///     while rs.next() {
///         let id: Option<u64> = rs.get("id")?;
///     }
/// }
/// ```
pub struct Connection {
    native: Arc<dyn NativeClient>,
    account: Arc<Account>,
    handle: Option<Box<dyn NativeHandle>>,
    session: SessionState,
    /// Bumped every time a native session is opened.
    session_id: u64,
    /// A transaction was dropped without commit or rollback.
    pending_rollback: bool,
    last_error: Option<ConnRsError>,
    error_handler: Option<ErrorHandler>,
}

impl Connection {
    /// Create a connection for `account`. No connection attempt is made yet.
    pub fn create(account: Arc<Account>, native: Arc<dyn NativeClient>) -> Self {
        Self {
            native,
            session: SessionState::pending(&account),
            account,
            handle: None,
            session_id: 0,
            pending_rollback: false,
            last_error: None,
            error_handler: None,
        }
    }

    /// Install a callback that receives every reported failure.
    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&ConnRsError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    /// Schema selected by the last successful schema change.
    pub fn schema(&self) -> Option<&str> {
        self.session.schema.as_deref()
    }

    /// Character set selected by the last successful charset change.
    pub fn charset(&self) -> Option<&str> {
        self.session.charset.as_deref()
    }

    /// Auto-commit mode of the session. Before connecting, the mode the
    /// account will select.
    pub fn auto_commit(&self) -> bool {
        self.session.auto_commit
    }

    /// The most recent failure reported by this connection.
    pub fn last_error(&self) -> Option<&ConnRsError> {
        self.last_error.as_ref()
    }

    /// Whether the native library reports a live session.
    pub async fn connected(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => handle.is_alive().await,
            None => false,
        }
    }

    /// Connect if not already connected.
    pub async fn connect(&mut self) -> bool {
        let result = self.establish().await;
        self.check(result).is_some()
    }

    /// Close the native handle. Does nothing when there is none.
    pub fn disconnect(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
            // The server discards an open transaction with the session.
            self.pending_rollback = false;
            self.session = SessionState::pending(&self.account);
            tracing::debug!(host = self.account.host(), "disconnected");
        }
    }

    pub async fn set_schema(&mut self, schema: &str) -> bool {
        let result = self.select_schema(schema).await;
        self.check(result).is_some()
    }

    pub async fn set_charset(&mut self, charset: &str) -> bool {
        let result = self.select_charset(charset).await;
        self.check(result).is_some()
    }

    /// Change the auto-commit mode. Returns true without a round trip when
    /// the mode already matches [`auto_commit`](Connection::auto_commit).
    pub async fn set_auto_commit(&mut self, auto_commit: bool) -> bool {
        if self.session.auto_commit == auto_commit {
            return true;
        }
        let result = self.change_auto_commit(auto_commit).await;
        self.check(result).is_some()
    }

    /// Run a query and buffer its result.
    pub async fn query(&mut self, sql: &str) -> Option<ResultSet<'_>> {
        let result = self.fetch(sql).await;
        let raw = self.check(result)?;
        Some(ResultSet::new(self, raw))
    }

    /// Run a statement batch and return the total of affected rows.
    ///
    /// Result sets produced by the batch are discarded. When a statement
    /// fails, the rows affected by the statements before it are returned.
    pub async fn execute(&mut self, sql: &str) -> u64 {
        let outcome = self.run(sql).await;
        if let Some(err) = outcome.error {
            self.report(err);
        }
        outcome.affected_rows
    }

    /// Run a statement and return the id it generated, 0 on failure.
    pub async fn insert(&mut self, sql: &str) -> u64 {
        let result = self.insert_id(sql).await;
        self.check(result).unwrap_or(0)
    }

    pub async fn create_statement(&mut self, sql: &str) -> Option<Statement<'_>> {
        let ready = self.ensure_connected().await.map(|_| ());
        self.check(ready)?;
        Some(Statement::new(self, sql))
    }

    pub async fn create_transaction(
        &mut self,
        level: IsolationLevel,
        consistent_snapshot: bool,
    ) -> Option<Transaction<'_>> {
        let begun = self.begin(level, consistent_snapshot).await;
        self.check(begun)?;
        Some(Transaction::new(self, level, consistent_snapshot))
    }

    async fn establish(&mut self) -> Result<()> {
        if self.connected().await {
            return Ok(());
        }

        // A handle whose session died is released before a new one is made.
        self.disconnect();

        let handle = self
            .native
            .init()
            .map_err(|e| ConnRsError::HandleAllocation(e.message))?;
        self.handle = Some(handle);

        let account = Arc::clone(&self.account);
        if let Err(err) = self.open_session(&account).await {
            self.disconnect();
            return Err(err);
        }

        tracing::debug!(
            host = account.host(),
            port = account.port(),
            schema = account.schema(),
            "connected"
        );
        Ok(())
    }

    async fn open_session(&mut self, account: &Account) -> Result<()> {
        let handle = self
            .handle
            .as_deref_mut()
            .ok_or(ConnRsError::NotConnected)?;

        if let Some(ssl) = account.ssl() {
            handle.set_ssl(ssl).map_err(ConnRsError::Connect)?;
        }
        handle
            .connect(ConnectParams::from_account(account))
            .await
            .map_err(ConnRsError::Connect)?;

        let mut session = SessionState::default();
        if account.auto_commit() != session.auto_commit {
            handle
                .set_autocommit(account.auto_commit())
                .await
                .map_err(ConnRsError::Configuration)?;
            session.auto_commit = account.auto_commit();
        }

        if let Some(schema) = account.schema() {
            handle
                .select_db(schema)
                .await
                .map_err(ConnRsError::Configuration)?;
            session.schema = Some(schema.to_string());
        }

        for (key, value) in account.options() {
            let sql = handle.session_option_sql(key, value);
            run_batch(&mut *handle, &sql)
                .await
                .into_result()
                .map_err(ConnRsError::into_configuration)?;
        }

        self.session = session;
        self.session_id += 1;
        self.pending_rollback = false;
        Ok(())
    }

    /// Connect if needed and hand out the live native handle.
    async fn ensure_connected(&mut self) -> Result<&mut (dyn NativeHandle + 'static)> {
        self.establish().await?;

        if self.pending_rollback {
            self.pending_rollback = false;
            if let Some(handle) = self.handle.as_deref_mut() {
                if let Err(err) = run_batch(handle, "ROLLBACK").await.into_result() {
                    self.report(err);
                }
            }
        }

        self.handle
            .as_deref_mut()
            .ok_or(ConnRsError::NotConnected)
    }

    async fn select_schema(&mut self, schema: &str) -> Result<()> {
        let handle = self.ensure_connected().await?;
        handle
            .select_db(schema)
            .await
            .map_err(ConnRsError::Configuration)?;
        self.session.schema = Some(schema.to_string());
        Ok(())
    }

    async fn select_charset(&mut self, charset: &str) -> Result<()> {
        let handle = self.ensure_connected().await?;
        handle
            .set_charset(charset)
            .await
            .map_err(ConnRsError::Configuration)?;
        self.session.charset = Some(charset.to_string());
        Ok(())
    }

    async fn change_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        let handle = self.ensure_connected().await?;
        handle
            .set_autocommit(auto_commit)
            .await
            .map_err(ConnRsError::Configuration)?;
        self.session.auto_commit = auto_commit;
        Ok(())
    }

    async fn fetch(&mut self, sql: &str) -> Result<RawQueryResult> {
        let handle = self.ensure_connected().await?;
        handle.real_query(sql).await.map_err(ConnRsError::Query)?;
        match handle.store_result() {
            StoredResult::Rows(result) => Ok(result),
            StoredResult::NoFields { .. } => Ok(RawQueryResult::empty()),
            StoredResult::Unavailable(err) => Err(ConnRsError::ResultShape(err)),
        }
    }

    async fn insert_id(&mut self, sql: &str) -> Result<u64> {
        let handle = self.ensure_connected().await?;
        handle.real_query(sql).await.map_err(ConnRsError::Query)?;
        Ok(handle.insert_id())
    }

    async fn begin(&mut self, level: IsolationLevel, consistent_snapshot: bool) -> Result<()> {
        let handle = self.ensure_connected().await?;
        for sql in handle.begin_statements(level, consistent_snapshot) {
            run_batch(&mut *handle, &sql).await.into_result()?;
        }
        Ok(())
    }

    async fn run(&mut self, sql: &str) -> BatchOutcome {
        match self.ensure_connected().await {
            Ok(handle) => run_batch(handle, sql).await,
            Err(err) => BatchOutcome::failed(err),
        }
    }

    /// Run a batch on session `session_id` only; fails if that session has ended.
    pub(crate) async fn run_in_session(&mut self, session_id: u64, sql: &str) -> BatchOutcome {
        if let Err(err) = self.ensure_connected().await {
            return BatchOutcome::failed(err);
        }
        if self.session_id != session_id {
            return BatchOutcome::failed(ConnRsError::TransactionLost);
        }
        match self.handle.as_deref_mut() {
            Some(handle) => run_batch(handle, sql).await,
            None => BatchOutcome::failed(ConnRsError::NotConnected),
        }
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id
    }

    pub(crate) async fn prepared(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<PreparedOutcome> {
        let handle = self.ensure_connected().await?;
        handle
            .run_prepared(sql, params)
            .await
            .map_err(ConnRsError::Query)
    }

    /// Issue `ROLLBACK` before the next operation.
    pub(crate) fn schedule_rollback(&mut self) {
        if self.handle.is_some() {
            self.pending_rollback = true;
        }
    }

    /// Turn a result into a sentinel, reporting the error.
    pub(crate) fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.report(err);
                None
            }
        }
    }

    pub(crate) fn report(&mut self, error: ConnRsError) {
        tracing::error!(
            code = error.code(),
            sqlstate = error.native().and_then(|e| e.sqlstate.as_deref()),
            error = %error,
            "database operation failed"
        );
        if let Some(handler) = &self.error_handler {
            handler(&error);
        }
        self.last_error = Some(error);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.account.host())
            .field("has_handle", &self.handle.is_some())
            .field("session", &self.session)
            .field("session_id", &self.session_id)
            .field("pending_rollback", &self.pending_rollback)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Submit `sql` and walk every result it produces.
///
/// Buffered results are discarded and the affected rows of field-less
/// results are summed. A result with fields that cannot be stored, or a
/// failing statement, stops the walk with the total so far.
async fn run_batch(handle: &mut dyn NativeHandle, sql: &str) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    if let Err(err) = handle.real_query(sql).await {
        outcome.error = Some(ConnRsError::Query(err));
        return outcome;
    }

    loop {
        match handle.store_result() {
            StoredResult::Rows(_) => {}
            StoredResult::NoFields { affected_rows } => outcome.affected_rows += affected_rows,
            StoredResult::Unavailable(err) => {
                outcome.error = Some(ConnRsError::ResultShape(err));
                return outcome;
            }
        }

        match handle.next_result().await {
            Ok(true) => {}
            Ok(false) => return outcome,
            Err(err) => {
                outcome.error = Some(ConnRsError::Query(err));
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{InMemoryNativeClient, NativeCall, ScriptedBatch};
    use crate::error::NativeError;

    fn connection(native: &Arc<InMemoryNativeClient>) -> Connection {
        let native: Arc<dyn NativeClient> = Arc::clone(native) as Arc<dyn NativeClient>;
        Connection::create(Arc::new(Account::new("localhost", "root", "")), native)
    }

    #[tokio::test]
    async fn test_run_batch_sums_field_less_results() {
        let native = Arc::new(InMemoryNativeClient::new().with_response(
            ScriptedBatch::new()
                .affected(3)
                .rows(RawQueryResult::empty())
                .affected(4),
        ));
        let mut conn = connection(&native);
        assert!(conn.connect().await);

        let handle = conn.handle.as_deref_mut().unwrap();
        let outcome = run_batch(handle, "UPDATE a; SELECT 1; UPDATE b").await;
        assert_eq!(outcome.affected_rows, 7);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_run_batch_stops_at_trailing_error() {
        let native = Arc::new(InMemoryNativeClient::new().with_response(
            ScriptedBatch::new()
                .affected(2)
                .then_fail(NativeError::new(1146, "Table 'db.nope' doesn't exist")),
        ));
        let mut conn = connection(&native);
        assert!(conn.connect().await);

        let handle = conn.handle.as_deref_mut().unwrap();
        let outcome = run_batch(handle, "UPDATE a; UPDATE nope").await;
        assert_eq!(outcome.affected_rows, 2);
        assert!(matches!(outcome.error, Some(ConnRsError::Query(ref e)) if e.code == 1146));
    }

    #[tokio::test]
    async fn test_fresh_session_resets_cached_state() {
        let native = Arc::new(InMemoryNativeClient::new());
        let mut conn = connection(&native);

        assert!(conn.set_charset("utf8mb4").await);
        assert!(conn.set_auto_commit(false).await);
        assert_eq!(conn.charset(), Some("utf8mb4"));

        native.drop_sessions();
        assert!(conn.connect().await);

        assert_eq!(conn.charset(), None);
        assert!(conn.auto_commit());
        assert_eq!(native.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_schedule_rollback_without_handle_is_ignored() {
        let native = Arc::new(InMemoryNativeClient::new());
        let mut conn = connection(&native);

        conn.schedule_rollback();
        assert!(conn.connect().await);
        assert_eq!(conn.execute("SELECT 1").await, 0);

        assert_eq!(native.queries(), vec!["SELECT 1".to_string()]);
        assert_eq!(
            native.count_calls(|c| matches!(c, NativeCall::RealQuery(sql) if sql == "ROLLBACK")),
            0
        );
    }
}
