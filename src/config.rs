use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::session::Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriverKind {
    Postgres,
    Sqlite,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sqlstore")]
#[command(about = "sqlstore - run statements against PostgreSQL or SQLite through a managed session", long_about = None)]
pub struct Config {
    // Connection
    #[arg(long, value_enum, default_value = "postgres", env = "SQLSTORE_DRIVER")]
    pub driver: DriverKind,

    #[arg(long, default_value = "localhost", env = "SQLSTORE_HOST")]
    pub host: String,

    #[arg(short, long, default_value = "5432", env = "SQLSTORE_PORT")]
    pub port: u16,

    #[arg(short, long, default_value = "postgres", env = "SQLSTORE_USER")]
    pub user: String,

    #[arg(long, default_value = "", env = "SQLSTORE_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(short, long, default_value = "postgres", env = "SQLSTORE_DBNAME", help = "Database name, or file path for the sqlite driver")]
    pub dbname: String,

    #[arg(long, env = "SQLSTORE_SSL", help = "Require an encrypted connection")]
    pub ssl: bool,

    #[arg(long, env = "SQLSTORE_SSL_ROOT_CERT", help = "PEM file with extra trusted root certificates")]
    pub ssl_root_cert: Option<String>,

    #[arg(long, default_value = "10", env = "SQLSTORE_CONNECT_TIMEOUT", help = "Connect timeout in seconds, 0 to wait indefinitely")]
    pub connect_timeout: u64,

    // Bulk loading
    #[arg(long, default_value = "65536", env = "SQLSTORE_COPY_BUFFER_SIZE", help = "Bytes of COPY data buffered before a flush")]
    pub copy_buffer_size: usize,

    #[arg(long, default_value = "info", env = "SQLSTORE_LOG_LEVEL")]
    pub log_level: String,

    // Work to run once connected
    #[arg(short = 'e', long = "execute", help = "Statement to execute; may be repeated")]
    pub execute: Vec<String>,

    #[arg(short = 'q', long = "query", help = "Query whose rows are printed; may be repeated")]
    pub query: Vec<String>,
}

impl Config {
    /// Get a configuration instance with all values resolved from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    pub fn connect_timeout_duration(&self) -> Option<Duration> {
        (self.connect_timeout > 0).then(|| Duration::from_secs(self.connect_timeout))
    }

    /// Credentials for the configured database
    pub fn credentials(&self) -> Credentials {
        if self.driver == DriverKind::Sqlite {
            return Credentials::for_path(self.dbname.clone());
        }

        let mut credentials = Credentials::new(
            self.user.clone(),
            self.password.clone(),
            self.dbname.clone(),
            self.host.clone(),
            self.ssl,
        )
        .with_port(self.port);
        if let Some(timeout) = self.connect_timeout_duration() {
            credentials = credentials.with_connect_timeout(timeout);
        }
        credentials
    }
}
