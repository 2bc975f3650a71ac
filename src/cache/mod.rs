pub mod statement_registry;

pub use statement_registry::{RegistryStats, StatementRegistry};
