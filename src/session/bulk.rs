use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver::{CopyTarget, Driver, DriverError};
use crate::types::Value;
use crate::{Result, SqlStoreError};

type ConnectionGuard<D> = OwnedRwLockWriteGuard<Option<<D as Driver>::Connection>>;

/// An in-progress bulk load, started with [`Session::bulk_start`](crate::Session::bulk_start).
///
/// Rows are streamed with [`copy_row`](Self::copy_row) inside a single
/// transaction that [`commit`](Self::commit) makes durable. Any failure rolls
/// the whole load back, so the table either gains every row or none of them.
/// Dropping an unfinished load rolls it back in the background.
pub struct BulkLoad<D: Driver> {
    session_id: Uuid,
    driver: Arc<D>,
    guard: Option<ConnectionGuard<D>>,
    target: CopyTarget,
    active: Option<(D::Transaction, D::CopyIn)>,
    rows: u64,
}

impl<D: Driver> BulkLoad<D> {
    pub(crate) fn new(
        session_id: Uuid,
        driver: Arc<D>,
        guard: ConnectionGuard<D>,
        target: CopyTarget,
        tx: D::Transaction,
        copy: D::CopyIn,
    ) -> Self {
        Self {
            session_id,
            driver,
            guard: Some(guard),
            target,
            active: Some((tx, copy)),
            rows: 0,
        }
    }

    pub fn target(&self) -> &CopyTarget {
        &self.target
    }

    /// Rows accepted by `copy_row` so far
    pub fn rows_streamed(&self) -> u64 {
        self.rows
    }

    /// True until the load commits, rolls back or fails
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Stream one row. The values must match the target columns in number and order.
    ///
    /// If the row is rejected the transaction is rolled back before the error
    /// is returned and the load cannot be used any further.
    pub async fn copy_row(&mut self, row: &[Value]) -> Result<()> {
        let Some((_, copy)) = self.active.as_mut() else {
            return Err(SqlStoreError::BulkLoadFinished);
        };
        let conn = live_connection::<D>(&self.guard)?;

        let result = self.driver.copy_row(conn, copy, row).await;
        match result {
            Ok(()) => {
                self.rows += 1;
                Ok(())
            }
            Err(source) => {
                warn!(
                    "Session {} bulk load into {} failed at row {}: {}",
                    self.session_id,
                    self.target.qualified_table(),
                    self.rows + 1,
                    source
                );
                let rollback = self.abort().await;
                Err(SqlStoreError::Transaction { source, rollback })
            }
        }
    }

    /// Flush buffered rows, commit, and return the number of rows loaded.
    /// On failure the transaction is rolled back.
    pub async fn commit(mut self) -> Result<u64> {
        let Some((mut tx, copy)) = self.active.take() else {
            return Err(SqlStoreError::BulkLoadFinished);
        };
        let conn = live_connection::<D>(&self.guard)?;

        let copied = match self.driver.finish_copy(conn, copy).await {
            Ok(copied) => copied,
            Err(source) => {
                let rollback = self.driver.rollback(conn, tx).await.err();
                return Err(SqlStoreError::Transaction { source, rollback });
            }
        };

        if let Err(source) = self.driver.commit(conn, &mut tx).await {
            let rollback = self.driver.rollback(conn, tx).await.err();
            return Err(SqlStoreError::Transaction { source, rollback });
        }

        info!(
            "Session {} committed {} row(s) into {}",
            self.session_id,
            copied,
            self.target.qualified_table()
        );
        Ok(copied)
    }

    /// Abandon the load, discarding every row streamed so far
    pub async fn rollback(mut self) -> Result<()> {
        if self.active.is_none() {
            return Err(SqlStoreError::BulkLoadFinished);
        }
        match self.abort().await {
            None => Ok(()),
            Some(e) => Err(SqlStoreError::Rollback(e)),
        }
    }

    async fn abort(&mut self) -> Option<DriverError> {
        let (tx, copy) = self.active.take()?;
        // the copy stream must be released before the transaction can end
        drop(copy);
        let conn = live_connection::<D>(&self.guard).ok()?;

        debug!(
            "Session {} rolling back bulk load into {}",
            self.session_id,
            self.target.qualified_table()
        );
        self.driver.rollback(conn, tx).await.err()
    }
}

impl<D: Driver> Drop for BulkLoad<D> {
    fn drop(&mut self) {
        let Some((tx, copy)) = self.active.take() else {
            return;
        };
        let Some(guard) = self.guard.take() else {
            return;
        };
        drop(copy);

        warn!(
            "Session {} bulk load into {} dropped without commit, rolling back",
            self.session_id,
            self.target.qualified_table()
        );

        match Handle::try_current() {
            Ok(handle) => {
                let driver = self.driver.clone();
                let session_id = self.session_id;
                // The guard moves into the task so nothing else uses the
                // connection before the rollback lands
                handle.spawn(async move {
                    if let Some(conn) = guard.as_ref() {
                        if let Err(e) = driver.rollback(conn, tx).await {
                            error!("Session {} background rollback failed: {}", session_id, e);
                        }
                    }
                    drop(guard);
                });
            }
            Err(_) => {
                error!(
                    "Session {} dropped a bulk load outside a Tokio runtime; transaction left open",
                    self.session_id
                );
            }
        }
    }
}

fn live_connection<D: Driver>(guard: &Option<ConnectionGuard<D>>) -> Result<&D::Connection> {
    guard
        .as_ref()
        .and_then(|g| g.as_ref())
        .ok_or(SqlStoreError::NotConnected)
}
