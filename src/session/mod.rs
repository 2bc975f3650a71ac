// Session lifecycle, prepared statements and bulk loading
pub mod bulk;
pub mod credentials;
pub mod lifecycle;
pub mod state;

pub use bulk::BulkLoad;
pub use credentials::{Credentials, TransportSecurity};
pub use lifecycle::Session;
pub use state::ConnectionState;
