//! Common test utilities for transaction integration tests
#![allow(dead_code)]

use pessimist_common::{Row, Value};
use pessimist_txn::{Config, Engine, Error, QueryResult, Session, Statement};
use std::time::Duration;

/// Engine plus helpers shared by the integration tests
pub struct TestKit {
    pub engine: Engine,
}

impl TestKit {
    /// Engine with a lock wait timeout short enough for a stuck test to fail
    /// rather than hang
    pub fn new() -> Self {
        Self::with_config(Config::default().with_lock_wait_timeout(Duration::from_secs(5)))
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            engine: Engine::new(config),
        }
    }

    pub fn session(&self) -> Session {
        self.engine.session()
    }

    /// Wait until at least `count` lock waits are parked in the detector
    pub async fn wait_for_edges(&self, count: usize) {
        let detector = self.engine.detector();
        tokio::time::timeout(Duration::from_secs(5), async {
            while detector.edge_count() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("lock waiters never showed up");
    }
}

/// Build a row of integers
pub fn row(values: &[i64]) -> Row {
    values.iter().map(|&v| Value::Integer(v)).collect()
}

/// Execute a statement that must succeed
pub async fn must_exec(session: &mut Session, statement: Statement) -> QueryResult {
    match session.execute(statement).await {
        Ok(result) => result,
        Err(err) => panic!("statement failed: {err}"),
    }
}

/// Run a query that must succeed and return its rows
pub async fn must_query(session: &mut Session, statement: Statement) -> Vec<Row> {
    must_exec(session, statement).await.into_rows()
}

/// Execute a statement that must fail and return the error
pub async fn must_fail(session: &mut Session, statement: Statement) -> Error {
    match session.execute(statement).await {
        Ok(result) => panic!("statement unexpectedly succeeded: {result:?}"),
        Err(err) => err,
    }
}
