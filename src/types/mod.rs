// Module for bound parameters and decoded column values
pub mod value;

pub use value::{FromValue, Value};

/// Build a `Vec<Value>` from a list of expressions convertible into [`Value`].
///
/// ```
/// use sqlstore::{params, Value};
///
/// let args = params![3, "alice", None::<i64>];
/// assert_eq!(args[2], Value::Null);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::Value::from($value)),+]
    };
}
