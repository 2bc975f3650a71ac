pub mod tls_connector;

pub use tls_connector::{MakeRustlsConnect, RustlsStream, client_config};
