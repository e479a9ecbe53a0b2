use std::sync::Arc;

use connrs::drivers::{InMemoryNativeClient, InMemoryTestResponseBuilder, NativeCall, ScriptedBatch};
use connrs::error::{ConnRsError, NativeError};
use connrs::traits::NativeClient;
use connrs::types::SqlValue;
use connrs::{Account, Connection, IsolationLevel};

fn connection(native: &Arc<InMemoryNativeClient>) -> Connection {
    let native: Arc<dyn NativeClient> = Arc::clone(native) as Arc<dyn NativeClient>;
    Connection::create(Arc::new(Account::new("localhost", "root", "")), native)
}

fn prepared_calls(native: &InMemoryNativeClient) -> Vec<(String, Vec<SqlValue>)> {
    native
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            NativeCall::Prepared { sql, params } => Some((sql, params)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_statement_params_reach_native_layer_in_order() {
    let native = Arc::new(
        InMemoryNativeClient::new().with_response(ScriptedBatch::new().affected(1)),
    );
    let mut conn = connection(&native);

    let mut stmt = conn
        .create_statement("UPDATE users SET name = ?, score = ?, active = ? WHERE id = ?")
        .await
        .unwrap();
    stmt.bind("John").bind(7.5).bind(true).bind(42i64);
    assert_eq!(stmt.params().len(), 4);
    assert_eq!(stmt.execute().await, 1);

    assert_eq!(
        prepared_calls(&native),
        vec![(
            "UPDATE users SET name = ?, score = ?, active = ? WHERE id = ?".to_string(),
            vec![
                SqlValue::Text("John".to_string()),
                SqlValue::Float64(7.5),
                SqlValue::Bool(true),
                SqlValue::Int64(42),
            ],
        )]
    );
}

#[tokio::test]
async fn test_statement_set_fills_gaps_with_null() {
    let native = Arc::new(InMemoryNativeClient::new());
    let mut conn = connection(&native);

    let mut stmt = conn
        .create_statement("INSERT INTO t (a, b, c) VALUES (?, ?, ?)")
        .await
        .unwrap();
    stmt.set(2, 3);
    stmt.set(0, None::<i32>);
    assert_eq!(
        stmt.params(),
        &[SqlValue::Null, SqlValue::Null, SqlValue::Int32(3)]
    );

    stmt.clear();
    assert!(stmt.params().is_empty());
    assert_eq!(stmt.sql(), "INSERT INTO t (a, b, c) VALUES (?, ?, ?)");
}

#[tokio::test]
async fn test_statement_insert_and_reuse() {
    let native = Arc::new(InMemoryNativeClient::new().with_responses([
        ScriptedBatch::new().affected_with_id(1, 10),
        ScriptedBatch::new().affected_with_id(1, 11),
    ]));
    let mut conn = connection(&native);

    let mut stmt = conn
        .create_statement("INSERT INTO users (name) VALUES (?)")
        .await
        .unwrap();
    stmt.bind("John");
    assert_eq!(stmt.insert().await, 10);
    stmt.clear();
    stmt.bind("Jane");
    assert_eq!(stmt.insert().await, 11);

    let params: Vec<Vec<SqlValue>> = prepared_calls(&native).into_iter().map(|(_, p)| p).collect();
    assert_eq!(
        params,
        vec![
            vec![SqlValue::Text("John".to_string())],
            vec![SqlValue::Text("Jane".to_string())],
        ]
    );
}

#[tokio::test]
async fn test_statement_query() {
    let native = Arc::new(
        InMemoryNativeClient::new().with_response(
            ScriptedBatch::new().rows(
                InMemoryTestResponseBuilder::new()
                    .columns(&["id", "name"])
                    .row(&["1", "John"])
                    .build(),
            ),
        ),
    );
    let mut conn = connection(&native);

    let mut stmt = conn
        .create_statement("SELECT id, name FROM users WHERE name = ?")
        .await
        .unwrap();
    stmt.bind("John");
    let mut rs = stmt.query().await.unwrap();
    rs.single_row().unwrap();
    assert_eq!(rs.get::<i32, _>("id").unwrap(), Some(1));
    assert_eq!(rs.get_str("name").unwrap(), Some("John"));
}

#[tokio::test]
async fn test_statement_failure_returns_sentinel() {
    let native = Arc::new(InMemoryNativeClient::new().with_response(ScriptedBatch::failure(
        NativeError::new(1048, "Column 'name' cannot be null"),
    )));
    let mut conn = connection(&native);

    {
        let mut stmt = conn
            .create_statement("INSERT INTO users (name) VALUES (?)")
            .await
            .unwrap();
        stmt.bind(SqlValue::Null);
        assert_eq!(stmt.insert().await, 0);
    }
    assert!(matches!(conn.last_error(), Some(ConnRsError::Query(e)) if e.code == 1048));
}

#[tokio::test]
async fn test_transaction_rollback() {
    let native = Arc::new(InMemoryNativeClient::new());
    let mut conn = connection(&native);

    let mut tx = conn
        .create_transaction(IsolationLevel::RepeatableRead, false)
        .await
        .unwrap();
    {
        let mut stmt = tx.create_statement("DELETE FROM users WHERE id = ?").await.unwrap();
        stmt.bind(1);
        stmt.execute().await;
    }
    assert!(tx.rollback().await);

    assert_eq!(
        native.queries(),
        vec![
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ".to_string(),
            "START TRANSACTION".to_string(),
            "ROLLBACK".to_string(),
        ]
    );
    assert_eq!(prepared_calls(&native).len(), 1);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back_before_next_statement() {
    let native = Arc::new(InMemoryNativeClient::new());
    let mut conn = connection(&native);

    let tx = conn
        .create_transaction(IsolationLevel::Serializable, false)
        .await
        .unwrap();
    drop(tx);

    let mut stmt = conn.create_statement("SELECT 1").await.unwrap();
    stmt.query().await.unwrap();

    assert_eq!(native.last_query().as_deref(), Some("ROLLBACK"));
    assert_eq!(prepared_calls(&native).len(), 1);
}

#[tokio::test]
async fn test_failed_begin_returns_none() {
    let native = Arc::new(InMemoryNativeClient::new().on_query(
        "START TRANSACTION",
        ScriptedBatch::failure(NativeError::new(1568, "Transaction characteristics can't be changed")),
    ));
    let mut conn = connection(&native);

    assert!(conn
        .create_transaction(IsolationLevel::ReadCommitted, false)
        .await
        .is_none());
    assert!(matches!(conn.last_error(), Some(ConnRsError::Query(e)) if e.code == 1568));
}
