use std::fmt;
use std::time::Duration;

/// Whether the connection to the server is encrypted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportSecurity {
    #[default]
    Disable,
    Require,
}

impl TransportSecurity {
    pub fn from_flag(use_ssl: bool) -> Self {
        if use_ssl {
            TransportSecurity::Require
        } else {
            TransportSecurity::Disable
        }
    }

    /// libpq `sslmode` value
    pub fn as_sslmode(&self) -> &'static str {
        match self {
            TransportSecurity::Disable => "disable",
            TransportSecurity::Require => "require",
        }
    }
}

/// Connection parameters of one session. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    host: String,
    port: u16,
    user: String,
    password: String,
    dbname: String,
    security: TransportSecurity,
    connect_timeout: Option<Duration>,
}

impl Credentials {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        dbname: impl Into<String>,
        host: impl Into<String>,
        use_ssl: bool,
    ) -> Self {
        Self {
            host: host.into(),
            port: 5432,
            user: user.into(),
            password: password.into(),
            dbname: dbname.into(),
            security: TransportSecurity::from_flag(use_ssl),
            connect_timeout: None,
        }
    }

    /// Credentials for an embedded database identified only by its path
    pub fn for_path(path: impl Into<String>) -> Self {
        Self::new("", "", path, "", false)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    pub fn security(&self) -> TransportSecurity {
        self.security
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// libpq keyword/value connection string
    pub fn connection_string(&self) -> String {
        let mut parts = Vec::with_capacity(7);
        if !self.user.is_empty() {
            parts.push(format!("user={}", quote_value(&self.user)));
        }
        if !self.password.is_empty() {
            parts.push(format!("password={}", quote_value(&self.password)));
        }
        if !self.dbname.is_empty() {
            parts.push(format!("dbname={}", quote_value(&self.dbname)));
        }
        if !self.host.is_empty() {
            parts.push(format!("host={}", quote_value(&self.host)));
        }
        parts.push(format!("port={}", self.port));
        parts.push(format!("sslmode={}", self.security.as_sslmode()));
        if let Some(timeout) = self.connect_timeout {
            parts.push(format!("connect_timeout={}", timeout.as_secs().max(1)));
        }
        parts.join(" ")
    }
}

// Keep the password out of log lines
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("security", &self.security)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
