use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bulk::BulkLoad;
use super::credentials::Credentials;
use super::state::ConnectionState;
use crate::cache::{RegistryStats, StatementRegistry};
use crate::driver::{CopyTarget, Driver};
use crate::query::RowCursor;
use crate::types::Value;
use crate::{Result, SqlStoreError};

/// A database session: one connection, the credentials it was opened with,
/// and the named prepared statements that live on it.
///
/// All methods take `&self`, so a session can be shared across tasks behind
/// an `Arc`. Queries, executions and statement registration run concurrently
/// with each other. `connect`, `disconnect` and an active [`BulkLoad`] have
/// the connection to themselves and wait for in-flight work to drain first.
///
/// Calling any other session method from the task that holds an unfinished
/// `BulkLoad` waits until the load is committed, rolled back or dropped.
pub struct Session<D: Driver> {
    id: Uuid,
    driver: Arc<D>,
    credentials: Credentials,
    connection: Arc<RwLock<Option<D::Connection>>>,
    registry: StatementRegistry<D>,
}

impl<D: Driver> Session<D> {
    /// Create a disconnected session. Nothing is opened until [`connect`](Self::connect).
    pub fn new(driver: D, credentials: Credentials) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver: Arc::new(driver),
            credentials,
            connection: Arc::new(RwLock::new(None)),
            registry: StatementRegistry::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub async fn state(&self) -> ConnectionState {
        if self.connection.read().await.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    /// Open a connection with the stored credentials.
    ///
    /// On a connected session this reconnects: the new connection is opened
    /// first, and only once it succeeds are the registered statements and the
    /// old connection closed. A failed reconnect leaves the session exactly
    /// as it was.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.connection.write().await;

        let conn = self
            .driver
            .open(&self.credentials)
            .await
            .map_err(SqlStoreError::Connection)?;

        if let Some(old) = slot.take() {
            info!("Session {} reconnecting, closing previous connection", self.id);
            for e in self.registry.close_all(&self.driver, &old).await {
                warn!("Session {}: {}", self.id, e);
            }
            if let Err(e) = self.driver.close(old).await {
                warn!("Session {} failed to close previous connection: {}", self.id, e);
            }
        }

        *slot = Some(conn);
        info!(
            "Session {} connected to {} database {:?} at {}",
            self.id,
            self.driver.name(),
            self.credentials.dbname(),
            self.credentials.host()
        );
        Ok(())
    }

    /// Close every registered statement, then the connection.
    ///
    /// The session is disconnected afterwards even when some closes fail;
    /// the failures are returned together as [`SqlStoreError::Disconnect`].
    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.connection.write().await;
        let conn = slot.take().ok_or(SqlStoreError::NotConnected)?;

        let mut errors = self.registry.close_all(&self.driver, &conn).await;
        if let Err(e) = self.driver.close(conn).await {
            warn!("Session {} failed to close connection: {}", self.id, e);
            errors.push(e);
        }

        info!("Session {} disconnected", self.id);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SqlStoreError::Disconnect(errors))
        }
    }

    /// Run a one-off statement and return the number of affected rows
    pub async fn exec(&self, query: &str, args: &[Value]) -> Result<u64> {
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(SqlStoreError::NotConnected)?;

        debug!("Session {} exec: {}", self.id, query);
        let stmt = self.prepare_once(conn, query).await?;
        let result = self.driver.execute(conn, &stmt, args).await;
        self.discard(conn, &stmt).await;
        result.map_err(SqlStoreError::Execution)
    }

    /// Run a one-off query and return a cursor over its rows
    pub async fn query(&self, query: &str, args: &[Value]) -> Result<RowCursor> {
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(SqlStoreError::NotConnected)?;

        debug!("Session {} query: {}", self.id, query);
        let stmt = self.prepare_once(conn, query).await?;
        let result = self.driver.query(conn, &stmt, args).await;
        self.discard(conn, &stmt).await;
        result.map_err(SqlStoreError::Execution)
    }

    /// Prepare `query` and register it under `key`, replacing (and closing)
    /// whatever the key held before
    pub async fn prepare_add(&self, key: &str, query: &str) -> Result<()> {
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(SqlStoreError::NotConnected)?;

        self.registry.add(&self.driver, conn, key, query).await?;
        debug!("Session {} prepared {:?}", self.id, key);
        Ok(())
    }

    /// Close and unregister the statement under `key`. Unknown keys are ignored.
    pub async fn prepare_del(&self, key: &str) -> Result<()> {
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(SqlStoreError::NotConnected)?;

        self.registry.del(&self.driver, conn, key).await
    }

    pub async fn exec_prepared(&self, key: &str, args: &[Value]) -> Result<u64> {
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(SqlStoreError::NotConnected)?;

        let stmt = self.registry.lookup(key)?;
        self.driver
            .execute(conn, &stmt, args)
            .await
            .map_err(SqlStoreError::Execution)
    }

    pub async fn query_prepared(&self, key: &str, args: &[Value]) -> Result<RowCursor> {
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(SqlStoreError::NotConnected)?;

        let stmt = self.registry.lookup(key)?;
        self.driver
            .query(conn, &stmt, args)
            .await
            .map_err(SqlStoreError::Execution)
    }

    /// Keys of the registered prepared statements, sorted
    pub fn statement_keys(&self) -> Vec<String> {
        self.registry.keys()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Borrow the live connection, e.g. to reach driver-specific APIs
    pub async fn with_connection<R>(&self, f: impl FnOnce(&D::Connection) -> R) -> Result<R> {
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(SqlStoreError::NotConnected)?;
        Ok(f(conn))
    }

    /// Begin a transaction and open a copy-in stream for `target`.
    ///
    /// The returned [`BulkLoad`] has exclusive use of the connection until it
    /// is committed, rolled back or dropped.
    pub async fn bulk_start(&self, target: CopyTarget) -> Result<BulkLoad<D>> {
        let guard = self.connection.clone().write_owned().await;
        let Some(conn) = guard.as_ref() else {
            return Err(SqlStoreError::NotConnected);
        };

        let mut tx = self
            .driver
            .begin(conn)
            .await
            .map_err(|source| SqlStoreError::Transaction {
                source,
                rollback: None,
            })?;

        let copy = match self.driver.prepare_copy(conn, &mut tx, &target).await {
            Ok(copy) => copy,
            Err(source) => {
                let rollback = self.driver.rollback(conn, tx).await.err();
                return Err(SqlStoreError::Transaction { source, rollback });
            }
        };

        info!(
            "Session {} started bulk load into {}",
            self.id,
            target.qualified_table()
        );
        Ok(BulkLoad::new(
            self.id,
            self.driver.clone(),
            guard,
            target,
            tx,
            copy,
        ))
    }

    /// Load `rows` into `target` in one transaction and return the number of
    /// rows committed. Nothing is kept if any row fails.
    pub async fn bulk_load<I, R>(&self, target: CopyTarget, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[Value]>,
    {
        let mut load = self.bulk_start(target).await?;
        for row in rows {
            load.copy_row(row.as_ref()).await?;
        }
        load.commit().await
    }

    async fn prepare_once(&self, conn: &D::Connection, query: &str) -> Result<D::Statement> {
        self.driver
            .prepare(conn, query)
            .await
            .map_err(|source| SqlStoreError::Preparation {
                query: query.to_string(),
                source,
            })
    }

    async fn discard(&self, conn: &D::Connection, stmt: &D::Statement) {
        if let Err(e) = self.driver.close_statement(conn, stmt).await {
            warn!("Session {} failed to close one-off statement: {}", self.id, e);
        }
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        if let Ok(slot) = self.connection.try_read() {
            if slot.is_some() && !self.registry.is_empty() {
                warn!(
                    "Session {} dropped while connected with {} prepared statement(s)",
                    self.id,
                    self.registry.len()
                );
            }
        }
    }
}
