use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, CopyInSink, NoTls};
use tracing::{debug, error, warn};

use super::{CopyTarget, Driver, DriverError, DriverResult, copy_text};
use crate::config::Config;
use crate::query::{Row, RowCursor};
use crate::session::{Credentials, TransportSecurity};
use crate::ssl::{MakeRustlsConnect, client_config};
use crate::types::Value;

const DEFAULT_COPY_BUFFER: usize = 64 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver for PostgreSQL servers, built on `tokio-postgres`.
///
/// Prepared statements are real server-side statements. Bulk loads use
/// `COPY ... FROM STDIN` in text format: rows are encoded into a local buffer
/// that is sent whenever it grows past the configured size, so streaming a
/// row costs no round trip.
///
/// Arguments are sent in binary and must match the parameter types the
/// server inferred. Integers widen or narrow across the integer, OID and
/// float types, but there is no text fallback: binding a [`Value`] to a
/// `NUMERIC` or other unlisted type fails with a type error. Cast such
/// parameters in SQL, e.g. `$1::int8::numeric`.
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    copy_buffer_size: usize,
    root_cert: Option<PathBuf>,
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self {
            copy_buffer_size: DEFAULT_COPY_BUFFER,
            root_cert: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut driver = Self::new().with_copy_buffer_size(config.copy_buffer_size);
        driver.root_cert = config.ssl_root_cert.as_ref().map(PathBuf::from);
        driver
    }

    /// Bytes of encoded rows buffered before they are sent to the server
    pub fn with_copy_buffer_size(mut self, bytes: usize) -> Self {
        self.copy_buffer_size = bytes.max(1);
        self
    }

    /// Trust the certificates in this PEM file in addition to the web PKI roots
    pub fn with_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_cert = Some(path.into());
        self
    }
}

pub struct PgConnection {
    client: Client,
    task: JoinHandle<()>,
}

impl PgConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// A server-side prepared statement. Closing drops the last reference the
/// driver holds, which makes `tokio-postgres` send the Close message.
pub struct PgStatement {
    inner: RwLock<Option<tokio_postgres::Statement>>,
}

impl PgStatement {
    fn get(&self) -> DriverResult<tokio_postgres::Statement> {
        self.inner.read().clone().ok_or(DriverError::StatementClosed)
    }
}

pub struct PgTransaction {
    _private: (),
}

pub struct PgCopyIn {
    sink: Pin<Box<CopyInSink<Bytes>>>,
    buffer: BytesMut,
    threshold: usize,
    columns: usize,
}

fn spawn_connection<S, T>(connection: tokio_postgres::Connection<S, T>) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Postgres connection error: {}", e);
        }
    })
}

fn check_arity(expected: usize, args: &[Value]) -> DriverResult<()> {
    if expected != args.len() {
        return Err(DriverError::ArgumentCount {
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql_checked(ty, out),
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::OID => u32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                _ => i.to_sql_checked(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql_checked(ty, out),
            },
            Value::Text(s) => s.to_sql_checked(ty, out),
            Value::Bytes(b) => b.to_sql_checked(ty, out),
            Value::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => ts.and_utc().to_sql(ty, out),
                _ => ts.to_sql_checked(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn decode_row(row: &tokio_postgres::Row, columns: &Arc<[String]>) -> DriverResult<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        values.push(decode_column(row, idx, column.type_())?);
    }
    Ok(Row::new(columns.clone(), values))
}

fn decode_column(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> DriverResult<Value> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(Value::from),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(Value::from),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        Type::TIMESTAMP => row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|ts| Value::Timestamp(ts.naive_utc())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|d| Value::Timestamp(d.and_time(NaiveTime::MIN))),
        _ => return Err(DriverError::UnsupportedType(ty.name().to_string())),
    };
    Ok(value.unwrap_or(Value::Null))
}

#[async_trait]
impl Driver for PostgresDriver {
    type Connection = PgConnection;
    type Statement = PgStatement;
    type Transaction = PgTransaction;
    type CopyIn = PgCopyIn;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn open(&self, credentials: &Credentials) -> DriverResult<PgConnection> {
        let config: tokio_postgres::Config = credentials.connection_string().parse()?;

        let (client, task) = match credentials.security() {
            TransportSecurity::Disable => {
                let (client, connection) = config.connect(NoTls).await?;
                (client, spawn_connection(connection))
            }
            TransportSecurity::Require => {
                let tls = MakeRustlsConnect::new(client_config(self.root_cert.as_deref())?);
                let (client, connection) = config.connect(tls).await?;
                (client, spawn_connection(connection))
            }
        };

        debug!(
            "Connected to postgres at {}:{} as {}",
            credentials.host(),
            credentials.port(),
            credentials.user()
        );
        Ok(PgConnection { client, task })
    }

    async fn close(&self, conn: PgConnection) -> DriverResult<()> {
        let PgConnection { client, mut task } = conn;
        drop(client);

        // Rows still held by callers keep the client alive
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DriverError::Message(format!("connection task failed: {e}"))),
            Err(_) => {
                warn!("Postgres connection still in use after {:?}, aborting it", CLOSE_TIMEOUT);
                task.abort();
                Err(DriverError::Message(
                    "connection did not shut down in time".to_string(),
                ))
            }
        }
    }

    async fn prepare(&self, conn: &PgConnection, query: &str) -> DriverResult<PgStatement> {
        let statement = conn.client.prepare(query).await?;
        Ok(PgStatement {
            inner: RwLock::new(Some(statement)),
        })
    }

    async fn close_statement(&self, _conn: &PgConnection, stmt: &PgStatement) -> DriverResult<()> {
        match stmt.inner.write().take() {
            Some(_) => Ok(()),
            None => Err(DriverError::StatementClosed),
        }
    }

    async fn execute(&self, conn: &PgConnection, stmt: &PgStatement, args: &[Value]) -> DriverResult<u64> {
        let statement = stmt.get()?;
        check_arity(statement.params().len(), args)?;
        let params: Vec<&(dyn ToSql + Sync)> =
            args.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        Ok(conn.client.execute(&statement, &params).await?)
    }

    async fn query(&self, conn: &PgConnection, stmt: &PgStatement, args: &[Value]) -> DriverResult<RowCursor> {
        let statement = stmt.get()?;
        check_arity(statement.params().len(), args)?;
        let columns: Arc<[String]> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let stream = conn
            .client
            .query_raw(&statement, args.iter().map(|v| v as &dyn ToSql))
            .await?;
        let row_columns = columns.clone();
        let rows = stream
            .map(move |row| {
                row.map_err(DriverError::from)
                    .and_then(|row| decode_row(&row, &row_columns))
            })
            .boxed();
        Ok(RowCursor::new(columns, rows))
    }

    async fn begin(&self, conn: &PgConnection) -> DriverResult<PgTransaction> {
        conn.client.batch_execute("BEGIN").await?;
        Ok(PgTransaction { _private: () })
    }

    async fn prepare_copy(
        &self,
        conn: &PgConnection,
        _tx: &mut PgTransaction,
        target: &CopyTarget,
    ) -> DriverResult<PgCopyIn> {
        if target.columns.is_empty() {
            return Err(DriverError::Message(
                "bulk load needs at least one column".to_string(),
            ));
        }
        let sql = format!(
            "COPY {} ({}) FROM STDIN",
            target.qualified_table(),
            target.column_list()
        );
        let sink: CopyInSink<Bytes> = conn.client.copy_in(sql.as_str()).await?;
        Ok(PgCopyIn {
            sink: Box::pin(sink),
            buffer: BytesMut::with_capacity(self.copy_buffer_size),
            threshold: self.copy_buffer_size,
            columns: target.columns.len(),
        })
    }

    async fn copy_row(&self, _conn: &PgConnection, copy: &mut PgCopyIn, row: &[Value]) -> DriverResult<()> {
        check_arity(copy.columns, row)?;
        copy_text::encode_row(row, &mut copy.buffer);
        if copy.buffer.len() >= copy.threshold {
            let chunk = copy.buffer.split().freeze();
            copy.sink.send(chunk).await?;
        }
        Ok(())
    }

    async fn finish_copy(&self, _conn: &PgConnection, mut copy: PgCopyIn) -> DriverResult<u64> {
        if !copy.buffer.is_empty() {
            let chunk = copy.buffer.split().freeze();
            copy.sink.send(chunk).await?;
        }
        Ok(copy.sink.as_mut().finish().await?)
    }

    async fn commit(&self, conn: &PgConnection, _tx: &mut PgTransaction) -> DriverResult<()> {
        conn.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&self, conn: &PgConnection, _tx: PgTransaction) -> DriverResult<()> {
        conn.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}
