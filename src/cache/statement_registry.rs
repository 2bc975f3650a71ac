use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::driver::{Driver, DriverError};
use crate::{Result, SqlStoreError};

/// Named prepared statements of one connection.
///
/// Lookups only take the map's read lock and never wait on a prepare or a
/// close. Writers prepare before entering the writer gate, then swap the map
/// entry and close the superseded handle while holding the gate, so
/// `add`/`del` are serialized with each other but a slow round trip never
/// blocks readers. An entry becomes visible only once fully prepared.
pub struct StatementRegistry<D: Driver> {
    entries: RwLock<HashMap<String, Arc<D::Statement>>>,
    writer: Mutex<()>,
    metrics: RegistryMetrics,
}

#[derive(Default)]
struct RegistryMetrics {
    prepared: AtomicU64,
    replaced: AtomicU64,
    removed: AtomicU64,
    lookups: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_statements: usize,
    pub prepared: u64,
    pub replaced: u64,
    pub removed: u64,
    pub lookups: u64,
    pub misses: u64,
}

impl<D: Driver> Default for StatementRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Driver> StatementRegistry<D> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
            metrics: RegistryMetrics::default(),
        }
    }

    /// Prepare `query` and register it under `key`, closing any statement the
    /// key previously held. When preparation fails the registry is unchanged.
    pub async fn add(&self, driver: &D, conn: &D::Connection, key: &str, query: &str) -> Result<()> {
        if key.is_empty() {
            return Err(SqlStoreError::InvalidKey);
        }

        let statement = driver
            .prepare(conn, query)
            .await
            .map_err(|source| SqlStoreError::Preparation {
                query: query.to_string(),
                source,
            })?;

        let _writer = self.writer.lock().await;
        let previous = self
            .entries
            .write()
            .insert(key.to_string(), Arc::new(statement));
        self.metrics.prepared.fetch_add(1, Ordering::Relaxed);

        if let Some(previous) = previous {
            self.metrics.replaced.fetch_add(1, Ordering::Relaxed);
            debug!("Replaced prepared statement {:?}", key);
            // The new statement is already registered; a failed close only leaks server state
            if let Err(e) = driver.close_statement(conn, &previous).await {
                warn!("Failed to close superseded statement {:?}: {}", key, e);
            }
        }
        Ok(())
    }

    /// Remove and close the statement under `key`. Removing a key that is not
    /// registered succeeds.
    pub async fn del(&self, driver: &D, conn: &D::Connection, key: &str) -> Result<()> {
        let _writer = self.writer.lock().await;
        let removed = self.entries.write().remove(key);

        match removed {
            Some(statement) => {
                self.metrics.removed.fetch_add(1, Ordering::Relaxed);
                driver
                    .close_statement(conn, &statement)
                    .await
                    .map_err(|source| SqlStoreError::StatementClose {
                        key: key.to_string(),
                        source,
                    })
            }
            None => Ok(()),
        }
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<D::Statement>> {
        self.metrics.lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.entries.read().get(key).cloned();
        found.ok_or_else(|| {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            SqlStoreError::UnknownStatement(key.to_string())
        })
    }

    /// Remove every entry and close it, returning the failures. The registry
    /// is empty afterwards whether or not the closes succeed.
    pub async fn close_all(&self, driver: &D, conn: &D::Connection) -> Vec<DriverError> {
        let _writer = self.writer.lock().await;
        let drained: Vec<(String, Arc<D::Statement>)> = self.entries.write().drain().collect();

        let mut errors = Vec::new();
        for (key, statement) in drained {
            self.metrics.removed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = driver.close_statement(conn, &statement).await {
                warn!("Failed to close prepared statement {:?}: {}", key, e);
                errors.push(e);
            }
        }
        errors
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_statements: self.len(),
            prepared: self.metrics.prepared.load(Ordering::Relaxed),
            replaced: self.metrics.replaced.load(Ordering::Relaxed),
            removed: self.metrics.removed.load(Ordering::Relaxed),
            lookups: self.metrics.lookups.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteDriver;
    use crate::driver::sqlite::SqliteConnection;
    use crate::session::Credentials;
    use crate::types::Value;

    async fn setup() -> (SqliteDriver, SqliteConnection, StatementRegistry<SqliteDriver>) {
        let driver = SqliteDriver::new();
        let conn = driver.open(&Credentials::for_path(":memory:")).await.unwrap();
        (driver, conn, StatementRegistry::new())
    }

    #[tokio::test]
    async fn test_add_then_lookup() {
        let (driver, conn, registry) = setup().await;
        registry.add(&driver, &conn, "one", "SELECT ?1 + 1").await.unwrap();

        let stmt = registry.lookup("one").unwrap();
        let rows = driver
            .query(&conn, &stmt, &[Value::Int(41)])
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(rows[0].get::<i64>(0).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_readd_closes_previous_statement() {
        let (driver, conn, registry) = setup().await;
        registry.add(&driver, &conn, "q", "SELECT 1").await.unwrap();
        let first = registry.lookup("q").unwrap();
        registry.add(&driver, &conn, "q", "SELECT 2").await.unwrap();

        assert!(first.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(conn.live_statements(), 1);
        assert_eq!(registry.stats().replaced, 1);
    }

    #[tokio::test]
    async fn test_failed_prepare_leaves_registry_unchanged() {
        let (driver, conn, registry) = setup().await;
        registry.add(&driver, &conn, "q", "SELECT 1").await.unwrap();

        let err = registry
            .add(&driver, &conn, "q", "SELEKT nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, SqlStoreError::Preparation { .. }));

        let stmt = registry.lookup("q").unwrap();
        assert_eq!(stmt.sql(), "SELECT 1");
        assert!(!stmt.is_closed());
    }

    #[tokio::test]
    async fn test_del_is_idempotent() {
        let (driver, conn, registry) = setup().await;
        registry.del(&driver, &conn, "missing").await.unwrap();

        registry.add(&driver, &conn, "q", "SELECT 1").await.unwrap();
        registry.del(&driver, &conn, "q").await.unwrap();
        assert!(matches!(
            registry.lookup("q"),
            Err(SqlStoreError::UnknownStatement(key)) if key == "q"
        ));
        assert_eq!(conn.live_statements(), 0);
    }

    #[tokio::test]
    async fn test_empty_key_rejected_before_prepare() {
        let (driver, conn, registry) = setup().await;
        assert!(matches!(
            registry.add(&driver, &conn, "", "SELECT 1").await,
            Err(SqlStoreError::InvalidKey)
        ));
        assert_eq!(conn.live_statements(), 0);
    }

    #[tokio::test]
    async fn test_close_all_drains() {
        let (driver, conn, registry) = setup().await;
        for key in ["a", "b", "c"] {
            registry.add(&driver, &conn, key, "SELECT 1").await.unwrap();
        }
        assert_eq!(registry.keys(), vec!["a", "b", "c"]);

        let errors = registry.close_all(&driver, &conn).await;
        assert!(errors.is_empty());
        assert!(registry.is_empty());
        assert_eq!(conn.live_statements(), 0);
    }

    #[tokio::test]
    async fn test_stats_count_misses() {
        let (driver, conn, registry) = setup().await;
        registry.add(&driver, &conn, "q", "SELECT 1").await.unwrap();
        let _ = registry.lookup("q");
        let _ = registry.lookup("nope");

        let stats = registry.stats();
        assert_eq!(stats.live_statements, 1);
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.misses, 1);
    }
}
