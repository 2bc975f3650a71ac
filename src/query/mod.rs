// Module for result rows returned by query execution
pub mod rows;

pub use rows::{Row, RowCursor};
