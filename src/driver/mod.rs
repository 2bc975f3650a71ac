//! Database driver capability.
//!
//! A [`Session`](crate::Session) never talks to a database directly. It goes
//! through a [`Driver`], which owns the wire protocol and exposes the handful
//! of primitives the session needs: open and close a connection, prepare and
//! close statements, run them with positional arguments, and stream rows into
//! a table inside one transaction.

pub mod copy_text;
pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use async_trait::async_trait;
use thiserror::Error;

use crate::query::RowCursor;
use crate::session::Credentials;
use crate::types::Value;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("statement has been closed")]
    StatementClosed,

    #[error("expected {expected} values, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },

    #[error("unsupported column type: {0}")]
    UnsupportedType(String),

    #[error("{0}")]
    Message(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// SQLSTATE code of a server-side error
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            DriverError::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }
}

/// Destination of a bulk load: a table, optionally schema-qualified, and the
/// columns every streamed row fills in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    pub schema: Option<String>,
    pub table: String,
    pub columns: Vec<String>,
}

impl CopyTarget {
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schema: None,
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Quoted, optionally schema-qualified table name
    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }

    /// Quoted, comma separated column list
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Quote an identifier so it is passed to the server verbatim
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The primitives a database client must provide to back a session.
///
/// Handles are owned by the caller: the session keeps the connection, the
/// statement registry keeps prepared statements, and a bulk load keeps its
/// transaction and copy handle together until it commits or rolls back.
/// Closing a statement takes it by reference because executions already in
/// flight may still share it; a closed statement must fail later executions
/// with [`DriverError::StatementClosed`] instead of panicking.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Statement: Send + Sync + 'static;
    type Transaction: Send + 'static;
    type CopyIn: Send + 'static;

    /// Name used in log lines
    fn name(&self) -> &'static str;

    async fn open(&self, credentials: &Credentials) -> DriverResult<Self::Connection>;

    async fn close(&self, conn: Self::Connection) -> DriverResult<()>;

    async fn prepare(&self, conn: &Self::Connection, query: &str) -> DriverResult<Self::Statement>;

    async fn close_statement(
        &self,
        conn: &Self::Connection,
        stmt: &Self::Statement,
    ) -> DriverResult<()>;

    /// Run a statement and return the number of affected rows
    async fn execute(
        &self,
        conn: &Self::Connection,
        stmt: &Self::Statement,
        args: &[Value],
    ) -> DriverResult<u64>;

    async fn query(
        &self,
        conn: &Self::Connection,
        stmt: &Self::Statement,
        args: &[Value],
    ) -> DriverResult<RowCursor>;

    async fn begin(&self, conn: &Self::Connection) -> DriverResult<Self::Transaction>;

    /// Prepare a copy-in bound to `tx` that accepts rows for `target`
    async fn prepare_copy(
        &self,
        conn: &Self::Connection,
        tx: &mut Self::Transaction,
        target: &CopyTarget,
    ) -> DriverResult<Self::CopyIn>;

    /// Buffer one row. Implementations flush in batches, not per row.
    async fn copy_row(
        &self,
        conn: &Self::Connection,
        copy: &mut Self::CopyIn,
        row: &[Value],
    ) -> DriverResult<()>;

    /// Signal end of data, flushing whatever is still buffered, and return
    /// the number of rows copied
    async fn finish_copy(&self, conn: &Self::Connection, copy: Self::CopyIn) -> DriverResult<u64>;

    /// Commit `tx`. On failure the transaction is still owned by the caller,
    /// which must roll it back.
    async fn commit(&self, conn: &Self::Connection, tx: &mut Self::Transaction) -> DriverResult<()>;

    async fn rollback(&self, conn: &Self::Connection, tx: Self::Transaction) -> DriverResult<()>;
}
