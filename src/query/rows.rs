use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

use crate::driver::DriverError;
use crate::types::{FromValue, Value};
use crate::{Result, SqlStoreError};

/// A single decoded result row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Decode the value at `idx` into `T`
    pub fn get<T: FromValue>(&self, idx: usize) -> Result<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            SqlStoreError::Decode(format!(
                "column index {idx} out of range for row with {} columns",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Decode the first column named `name` into `T`
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SqlStoreError::Decode(format!("no column named {name:?}")))?;
        self.get(idx)
    }
}

/// Lazy, forward-only cursor over the rows of one query.
///
/// The cursor cannot be restarted. Once it is exhausted or has yielded an
/// error it releases the underlying stream and yields nothing further.
pub struct RowCursor {
    columns: Arc<[String]>,
    stream: Option<BoxStream<'static, std::result::Result<Row, DriverError>>>,
}

impl RowCursor {
    pub fn new(
        columns: Arc<[String]>,
        stream: BoxStream<'static, std::result::Result<Row, DriverError>>,
    ) -> Self {
        Self {
            columns,
            stream: Some(stream),
        }
    }

    /// Cursor over rows that were already fetched
    pub fn from_rows(columns: Arc<[String]>, rows: Vec<Row>) -> Self {
        Self::new(columns, stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_exhausted(&self) -> bool {
        self.stream.is_none()
    }

    /// Fetch the next row, or `None` once the cursor is exhausted
    pub async fn next(&mut self) -> Option<Result<Row>> {
        let stream = self.stream.as_mut()?;
        match stream.next().await {
            Some(Ok(row)) => Some(Ok(row)),
            Some(Err(e)) => {
                self.stream = None;
                Some(Err(SqlStoreError::Execution(e)))
            }
            None => {
                self.stream = None;
                None
            }
        }
    }

    /// Drain the remaining rows into a vector
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("columns", &self.columns)
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}
