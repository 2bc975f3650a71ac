use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, ToSql, params_from_iter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use super::{CopyTarget, Driver, DriverError, DriverResult};
use crate::query::{Row, RowCursor};
use crate::session::Credentials;
use crate::types::Value;

const DEFAULT_COPY_BATCH: usize = 1024;
const STATEMENT_CACHE_CAPACITY: usize = 128;

/// Driver for embedded SQLite databases.
///
/// The database path is taken from [`Credentials::dbname`]; `:memory:` or an
/// empty name opens a private in-memory database. Calls run on the caller's
/// task while holding the connection mutex, so keep statements short.
///
/// Query results are read in full before the cursor is returned, so a
/// `RowCursor` from this driver is forward-only but not lazy.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    copy_batch_size: usize,
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            copy_batch_size: DEFAULT_COPY_BATCH,
        }
    }

    /// Number of rows a bulk load buffers before inserting them
    pub fn with_copy_batch_size(mut self, rows: usize) -> Self {
        self.copy_batch_size = rows.max(1);
        self
    }
}

pub struct SqliteConnection {
    conn: Mutex<Connection>,
    live_statements: AtomicUsize,
}

impl SqliteConnection {
    /// Statements prepared through this connection and not yet closed
    pub fn live_statements(&self) -> usize {
        self.live_statements.load(Ordering::Acquire)
    }
}

pub struct SqliteStatement {
    sql: String,
    parameter_count: usize,
    columns: Arc<[String]>,
    closed: AtomicBool,
}

impl SqliteStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_args(&self, args: &[Value]) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::StatementClosed);
        }
        if args.len() != self.parameter_count {
            return Err(DriverError::ArgumentCount {
                expected: self.parameter_count,
                actual: args.len(),
            });
        }
        Ok(())
    }
}

pub struct SqliteTransaction {
    _private: (),
}

pub struct SqliteCopyIn {
    insert_sql: String,
    columns: usize,
    batch_size: usize,
    pending: Vec<Vec<Value>>,
    copied: u64,
}

impl SqliteCopyIn {
    fn flush(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut stmt = conn.prepare_cached(&self.insert_sql)?;
        for row in self.pending.drain(..) {
            stmt.execute(params_from_iter(row.iter()))?;
            self.copied += 1;
        }
        Ok(())
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Timestamp(ts) => ToSqlOutput::Owned(SqlValue::Text(
                ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            )),
        })
    }
}

fn decode(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    type Connection = SqliteConnection;
    type Statement = SqliteStatement;
    type Transaction = SqliteTransaction;
    type CopyIn = SqliteCopyIn;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&self, credentials: &Credentials) -> DriverResult<SqliteConnection> {
        let path = credentials.dbname();
        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX
                | OpenFlags::SQLITE_OPEN_URI;
            let conn = Connection::open_with_flags(path, flags)?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;",
            )?;
            conn
        };
        conn.execute_batch("PRAGMA temp_store=MEMORY;")?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        debug!("Opened sqlite database {:?}", if path.is_empty() { ":memory:" } else { path });
        Ok(SqliteConnection {
            conn: Mutex::new(conn),
            live_statements: AtomicUsize::new(0),
        })
    }

    async fn close(&self, conn: SqliteConnection) -> DriverResult<()> {
        let conn = conn.conn.into_inner();
        conn.close().map_err(|(_, e)| DriverError::Sqlite(e))
    }

    async fn prepare(&self, conn: &SqliteConnection, query: &str) -> DriverResult<SqliteStatement> {
        let (parameter_count, columns) = {
            let guard = conn.conn.lock();
            let stmt = guard.prepare_cached(query)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            (stmt.parameter_count(), columns)
        };
        conn.live_statements.fetch_add(1, Ordering::AcqRel);

        Ok(SqliteStatement {
            sql: query.to_string(),
            parameter_count,
            columns: Arc::from(columns),
            closed: AtomicBool::new(false),
        })
    }

    async fn close_statement(&self, conn: &SqliteConnection, stmt: &SqliteStatement) -> DriverResult<()> {
        if stmt.closed.swap(true, Ordering::AcqRel) {
            return Err(DriverError::StatementClosed);
        }
        conn.live_statements.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    async fn execute(&self, conn: &SqliteConnection, stmt: &SqliteStatement, args: &[Value]) -> DriverResult<u64> {
        stmt.check_args(args)?;
        let guard = conn.conn.lock();
        let mut prepared = guard.prepare_cached(&stmt.sql)?;
        let read_only = prepared.readonly();

        // Step through any rows (SELECT, PRAGMA, RETURNING) and discard them
        let mut rows = prepared.query(params_from_iter(args.iter()))?;
        while rows.next()?.is_some() {}
        drop(rows);

        if read_only {
            return Ok(0);
        }
        Ok(guard.changes() as u64)
    }

    async fn query(&self, conn: &SqliteConnection, stmt: &SqliteStatement, args: &[Value]) -> DriverResult<RowCursor> {
        stmt.check_args(args)?;
        let column_count = stmt.columns.len();
        let mut rows = Vec::new();
        {
            let guard = conn.conn.lock();
            let mut prepared = guard.prepare_cached(&stmt.sql)?;
            let mut result = prepared.query(params_from_iter(args.iter()))?;
            while let Some(row) = result.next()? {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    values.push(decode(row.get_ref(i)?));
                }
                rows.push(Row::new(stmt.columns.clone(), values));
            }
        }
        Ok(RowCursor::from_rows(stmt.columns.clone(), rows))
    }

    async fn begin(&self, conn: &SqliteConnection) -> DriverResult<SqliteTransaction> {
        conn.conn.lock().execute_batch("BEGIN")?;
        Ok(SqliteTransaction { _private: () })
    }

    async fn prepare_copy(
        &self,
        conn: &SqliteConnection,
        _tx: &mut SqliteTransaction,
        target: &CopyTarget,
    ) -> DriverResult<SqliteCopyIn> {
        if target.columns.is_empty() {
            return Err(DriverError::Message(
                "bulk load needs at least one column".to_string(),
            ));
        }
        let placeholders = (1..=target.columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            target.qualified_table(),
            target.column_list(),
            placeholders
        );
        conn.conn.lock().prepare_cached(&insert_sql)?;

        Ok(SqliteCopyIn {
            insert_sql,
            columns: target.columns.len(),
            batch_size: self.copy_batch_size,
            pending: Vec::with_capacity(self.copy_batch_size),
            copied: 0,
        })
    }

    async fn copy_row(&self, conn: &SqliteConnection, copy: &mut SqliteCopyIn, row: &[Value]) -> DriverResult<()> {
        if row.len() != copy.columns {
            return Err(DriverError::ArgumentCount {
                expected: copy.columns,
                actual: row.len(),
            });
        }
        copy.pending.push(row.to_vec());
        if copy.pending.len() >= copy.batch_size {
            copy.flush(&conn.conn.lock())?;
        }
        Ok(())
    }

    async fn finish_copy(&self, conn: &SqliteConnection, mut copy: SqliteCopyIn) -> DriverResult<u64> {
        copy.flush(&conn.conn.lock())?;
        Ok(copy.copied)
    }

    async fn commit(&self, conn: &SqliteConnection, _tx: &mut SqliteTransaction) -> DriverResult<()> {
        conn.conn.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback(&self, conn: &SqliteConnection, _tx: SqliteTransaction) -> DriverResult<()> {
        conn.conn.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }
}
