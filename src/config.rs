//! Connection configuration.
//!
//! A [`PgConfig`] is built once, wrapped in an `Arc`, and shared by every
//! connection made from it. Parsing connection strings or the environment is
//! left to the caller; the struct derives `Deserialize` so it can be loaded
//! from any serde format instead.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::frame::DEFAULT_MAX_FRAME_LEN;
use crate::types::TypeRegistry;

/// Whether to negotiate TLS before the startup message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Never send an SSLRequest.
    #[default]
    Disable,
    /// Try TLS, continue in plaintext if the server declines.
    Prefer,
    /// Fail the connection if the server declines TLS.
    Require,
}

/// Looks up a password when none is configured, e.g. from a pgpass file.
#[derive(Clone)]
pub struct PasswordLookup(Arc<dyn Fn(&PgConfig) -> Option<String> + Send + Sync>);

impl PasswordLookup {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&PgConfig) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn lookup(&self, config: &PgConfig) -> Option<String> {
        (self.0)(config)
    }
}

impl fmt::Debug for PasswordLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordLookup(..)")
    }
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PgConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 5432)
    pub port: u16,
    /// Username
    pub user: String,
    /// Password (optional)
    pub password: Option<String>,
    /// Database name
    pub database: String,
    /// Application name (optional)
    pub application_name: Option<String>,
    /// Extra run-time parameters sent in the startup message
    pub options: Vec<(String, String)>,
    pub ssl: SslMode,
    /// Deadline for transport connect plus startup
    pub connect_timeout: Option<Duration>,
    /// Client-side deadline for every query on the connection
    pub query_timeout: Option<Duration>,
    /// Statement cache capacity (default: 100, 0 disables caching)
    pub statement_cache_capacity: usize,
    /// Write requests without waiting for earlier ones to finish
    pub pipeline: bool,
    /// Largest backend frame accepted before the connection is torn down
    pub max_frame_len: usize,
    /// Connection-scoped decoder overrides
    #[serde(skip)]
    pub types: Arc<TypeRegistry>,
    /// Consulted when `password` is `None`
    #[serde(skip)]
    pub password_lookup: Option<PasswordLookup>,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            application_name: None,
            options: Vec::new(),
            ssl: SslMode::Disable,
            connect_timeout: None,
            query_timeout: None,
            statement_cache_capacity: 100,
            pipeline: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            types: TypeRegistry::empty(),
            password_lookup: None,
        }
    }
}

impl PgConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Add a run-time parameter to the startup message.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn ssl(mut self, mode: SslMode) -> Self {
        self.ssl = mode;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Fail a query locally when it takes longer than `timeout`. The
    /// connection stays open; a late response is discarded.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn pipeline(mut self, enabled: bool) -> Self {
        self.pipeline = enabled;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn types(mut self, registry: TypeRegistry) -> Self {
        self.types = Arc::new(registry);
        self
    }

    pub fn password_lookup(mut self, lookup: PasswordLookup) -> Self {
        self.password_lookup = Some(lookup);
        self
    }

    /// The configured password, or whatever the lookup hook returns.
    pub(crate) fn resolve_password(&self) -> Option<String> {
        self.password.clone().or_else(|| {
            self.password_lookup
                .as_ref()
                .and_then(|lookup| lookup.lookup(self))
        })
    }

    /// Parameters sent in the startup message besides user and database.
    pub(crate) fn startup_options(&self) -> Vec<(String, String)> {
        let mut options = Vec::with_capacity(self.options.len() + 2);
        if let Some(name) = &self.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
        options.push(("client_encoding".to_string(), "UTF8".to_string()));
        options.extend(self.options.iter().cloned());
        options
    }
}
