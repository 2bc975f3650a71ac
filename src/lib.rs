pub mod cache;
pub mod config;
pub mod driver;
pub mod query;
pub mod session;
pub mod ssl;
pub mod types;

pub use cache::{RegistryStats, StatementRegistry};
pub use config::Config;
pub use driver::{CopyTarget, Driver, DriverError, PostgresDriver, SqliteDriver};
pub use query::{Row, RowCursor};
pub use session::{BulkLoad, ConnectionState, Credentials, Session, TransportSecurity};
pub use types::{FromValue, Value};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqlStoreError {
    #[error("not connected to the database")]
    NotConnected,

    #[error("prepared statement {0:?} was not found")]
    UnknownStatement(String),

    #[error("prepared statement keys must not be empty")]
    InvalidKey,

    #[error("failed to connect: {0}")]
    Connection(#[source] DriverError),

    #[error("failed to prepare {query:?}: {source}")]
    Preparation {
        query: String,
        #[source]
        source: DriverError,
    },

    #[error("execution failed: {0}")]
    Execution(#[source] DriverError),

    #[error("failed to close prepared statement {key:?}: {source}")]
    StatementClose {
        key: String,
        #[source]
        source: DriverError,
    },

    #[error("bulk load failed: {source}{}", rollback_suffix(.rollback))]
    Transaction {
        #[source]
        source: DriverError,
        /// Outcome of the rollback issued after the failure.
        rollback: Option<DriverError>,
    },

    #[error("rollback failed: {0}")]
    Rollback(#[source] DriverError),

    #[error("bulk load has already been committed or rolled back")]
    BulkLoadFinished,

    #[error("disconnect finished with {} error(s): {}", .0.len(), join_errors(.0))]
    Disconnect(Vec<DriverError>),

    #[error("cannot decode column: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, SqlStoreError>;

impl SqlStoreError {
    /// The SQLSTATE reported by the server, if this error carries one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            SqlStoreError::Connection(e)
            | SqlStoreError::Preparation { source: e, .. }
            | SqlStoreError::Execution(e)
            | SqlStoreError::StatementClose { source: e, .. }
            | SqlStoreError::Transaction { source: e, .. }
            | SqlStoreError::Rollback(e) => e.sqlstate(),
            _ => None,
        }
    }

    /// True for a bulk-load failure that left no transaction open.
    pub fn rolled_back(&self) -> bool {
        matches!(self, SqlStoreError::Transaction { rollback: None, .. })
    }
}

fn rollback_suffix(rollback: &Option<DriverError>) -> String {
    match rollback {
        Some(e) => format!(" (rollback also failed: {e})"),
        None => String::new(),
    }
}

fn join_errors(errors: &[DriverError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
