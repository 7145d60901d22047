//! Async PostgreSQL wire-protocol client.
//!
//! This crate provides a PostgreSQL client that:
//! - Speaks protocol 3.0 over any async byte stream
//! - Authenticates with cleartext, MD5 or SCRAM-SHA-256 passwords
//! - Caches prepared statements per connection
//! - Supports query pipelining and server-side cursors
//! - Shares connections through a bounded pool with FIFO waiters
//!
//! Architecture:
//! - `frame`: Length-prefixed framing over arbitrarily chunked input
//! - `protocol`: Frontend/backend message encoding and decoding
//! - `connection`: Startup, SSL negotiation, authentication, cancellation
//! - `query`: Per-request response state machine
//! - `client`: Connection driver task and the `Client` handle
//! - `cursor`: Incremental reads through named portals
//! - `pool`: Connection pool

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod escape;
pub mod frame;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod result;
pub mod scram;
pub mod statement;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use client::{Client, ClientEvent};
pub use config::{PasswordLookup, PgConfig, SslMode};
pub use connection::{BackendKey, CancelToken, Connection};
pub use cursor::{Cursor, RowStream};
pub use error::{DbError, PgError, PgResult};
pub use escape::{escape_identifier, escape_literal};
pub use pool::{PgPool, PoolConfig, PoolStatus, PooledConnection};
pub use protocol::TransactionStatus;
pub use query::Query;
pub use result::{CommandTag, QueryResult, Row};
pub use transport::{Connector, TcpConnector};
pub use types::{Format, Oid, PgValue, TypeRegistry};
