#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use sqlstore::driver::{CopyTarget, DriverResult};
use sqlstore::{Credentials, Driver, DriverError, Row, RowCursor, Session, Value};

/// Call counts recorded by [`CountingDriver`]
#[derive(Default)]
pub struct Counters {
    pub calls: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub prepares: AtomicUsize,
    pub statement_closes: AtomicUsize,
    pub live_statements: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Failures to inject into [`CountingDriver`]
#[derive(Default)]
pub struct Faults {
    pub fail_open: AtomicBool,
    pub fail_statement_close: AtomicBool,
    pub fail_connection_close: AtomicBool,
    pub prepare_delay_ms: AtomicU64,
    /// Queries containing this text fail to prepare
    pub fail_prepare_containing: Mutex<Option<String>>,
}

/// In-process driver that records every call and never touches a database.
///
/// Rows containing the text value `"boom"` are rejected by `copy_row`.
#[derive(Clone, Default)]
pub struct CountingDriver {
    pub counters: Arc<Counters>,
    pub faults: Arc<Faults>,
}

pub struct FakeConnection {
    pub generation: usize,
}

pub struct FakeStatement {
    pub sql: String,
    pub generation: usize,
    closed: AtomicBool,
}

pub struct FakeTransaction;

pub struct FakeCopyIn {
    columns: usize,
    rows: u64,
}

impl CountingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        Counters::get(&self.counters.calls)
    }

    pub fn live_statements(&self) -> usize {
        Counters::get(&self.counters.live_statements)
    }

    fn tick(&self) {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Driver for CountingDriver {
    type Connection = FakeConnection;
    type Statement = FakeStatement;
    type Transaction = FakeTransaction;
    type CopyIn = FakeCopyIn;

    fn name(&self) -> &'static str {
        "counting"
    }

    async fn open(&self, _credentials: &Credentials) -> DriverResult<FakeConnection> {
        self.tick();
        if self.faults.fail_open.load(Ordering::SeqCst) {
            return Err(DriverError::Message("connection refused".to_string()));
        }
        let generation = self.counters.opens.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection { generation })
    }

    async fn close(&self, _conn: FakeConnection) -> DriverResult<()> {
        self.tick();
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_connection_close.load(Ordering::SeqCst) {
            return Err(DriverError::Message("close connection failed".to_string()));
        }
        Ok(())
    }

    async fn prepare(&self, conn: &FakeConnection, query: &str) -> DriverResult<FakeStatement> {
        self.tick();
        let delay = self.faults.prepare_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(marker) = self.faults.fail_prepare_containing.lock().as_deref() {
            if query.contains(marker) {
                return Err(DriverError::Message(format!("syntax error in {query:?}")));
            }
        }
        self.counters.prepares.fetch_add(1, Ordering::SeqCst);
        self.counters.live_statements.fetch_add(1, Ordering::SeqCst);
        Ok(FakeStatement {
            sql: query.to_string(),
            generation: conn.generation,
            closed: AtomicBool::new(false),
        })
    }

    async fn close_statement(&self, _conn: &FakeConnection, stmt: &FakeStatement) -> DriverResult<()> {
        self.tick();
        if stmt.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::StatementClosed);
        }
        self.counters.statement_closes.fetch_add(1, Ordering::SeqCst);
        self.counters.live_statements.fetch_sub(1, Ordering::SeqCst);
        if self.faults.fail_statement_close.load(Ordering::SeqCst) {
            return Err(DriverError::Message(format!("close {:?} failed", stmt.sql)));
        }
        Ok(())
    }

    async fn execute(&self, _conn: &FakeConnection, stmt: &FakeStatement, _args: &[Value]) -> DriverResult<u64> {
        self.tick();
        if stmt.closed.load(Ordering::SeqCst) {
            return Err(DriverError::StatementClosed);
        }
        Ok(1)
    }

    /// Yields one row: the statement text followed by the arguments
    async fn query(&self, _conn: &FakeConnection, stmt: &FakeStatement, args: &[Value]) -> DriverResult<RowCursor> {
        self.tick();
        if stmt.closed.load(Ordering::SeqCst) {
            return Err(DriverError::StatementClosed);
        }
        let mut names = vec!["sql".to_string()];
        names.extend((1..=args.len()).map(|i| format!("arg{i}")));
        let columns: Arc<[String]> = Arc::from(names);

        let mut values = vec![Value::Text(stmt.sql.clone())];
        values.extend(args.iter().cloned());
        Ok(RowCursor::from_rows(columns.clone(), vec![Row::new(columns, values)]))
    }

    async fn begin(&self, _conn: &FakeConnection) -> DriverResult<FakeTransaction> {
        self.tick();
        Ok(FakeTransaction)
    }

    async fn prepare_copy(
        &self,
        _conn: &FakeConnection,
        _tx: &mut FakeTransaction,
        target: &CopyTarget,
    ) -> DriverResult<FakeCopyIn> {
        self.tick();
        Ok(FakeCopyIn {
            columns: target.columns.len(),
            rows: 0,
        })
    }

    async fn copy_row(&self, _conn: &FakeConnection, copy: &mut FakeCopyIn, row: &[Value]) -> DriverResult<()> {
        self.tick();
        if row.len() != copy.columns {
            return Err(DriverError::ArgumentCount {
                expected: copy.columns,
                actual: row.len(),
            });
        }
        if row.iter().any(|v| matches!(v, Value::Text(s) if s == "boom")) {
            return Err(DriverError::Message("row rejected".to_string()));
        }
        copy.rows += 1;
        Ok(())
    }

    async fn finish_copy(&self, _conn: &FakeConnection, copy: FakeCopyIn) -> DriverResult<u64> {
        self.tick();
        Ok(copy.rows)
    }

    async fn commit(&self, _conn: &FakeConnection, _tx: &mut FakeTransaction) -> DriverResult<()> {
        self.tick();
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _conn: &FakeConnection, _tx: FakeTransaction) -> DriverResult<()> {
        self.tick();
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A disconnected session over a fresh [`CountingDriver`], plus a handle to its counters
pub fn counting_session() -> (Session<CountingDriver>, CountingDriver) {
    let driver = CountingDriver::new();
    let session = Session::new(
        driver.clone(),
        Credentials::new("app", "secret", "appdb", "localhost", false),
    );
    (session, driver)
}

/// Wait until background work spawned on the current runtime (such as a
/// drop-time rollback) has had a chance to run
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
