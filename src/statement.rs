//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side statement parsed on one connection
//! - `StatementCache`: O(1) LRU cache of those statements per connection
//!
//! Statements are keyed by query text plus parameter type OIDs, since the
//! same text parsed with different parameter types is a different statement
//! on the server.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::types::Oid;

/// A prepared statement that has been parsed by PostgreSQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Server-side name for this statement (e.g., "__pgkit_1")
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs sent with Parse
    pub param_types: Vec<Oid>,
}

impl PreparedStatement {
    pub fn new(name: String, query: String, param_types: Vec<Oid>) -> Self {
        Self {
            name,
            query,
            param_types,
        }
    }
}

/// Cache key for a query text and its parameter types.
pub(crate) fn cache_key(query: &str, param_types: &[Oid]) -> String {
    let mut key = String::with_capacity(query.len() + 1 + param_types.len() * 5);
    key.push_str(query);
    key.push('\0');
    for (i, oid) in param_types.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(&oid.to_string());
    }
    key
}

/// O(1) LRU cache for prepared statements.
///
/// Each connection maintains its own statement cache to avoid re-parsing
/// frequently executed queries. A capacity of zero disables caching.
pub struct StatementCache {
    /// cache key → statement; `None` when caching is disabled
    cache: Option<LruCache<String, Arc<PreparedStatement>>>,
    /// Counter for generating unique statement names
    next_id: u64,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
            next_id: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Get and mark as recently used.
    pub fn get(&mut self, key: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.as_mut()?.get(key).map(Arc::clone)
    }

    /// Insert a statement.
    ///
    /// If the cache is at capacity the least recently used statement is
    /// evicted and returned so it can be closed on the server.
    pub fn insert(
        &mut self,
        key: String,
        statement: Arc<PreparedStatement>,
    ) -> Option<Arc<PreparedStatement>> {
        let cache = self.cache.as_mut()?;
        // push hands back the old value when the key was already present
        let replacing = cache.contains(&key);
        let popped = cache.push(key, statement);
        if replacing {
            None
        } else {
            popped.map(|(_, evicted)| evicted)
        }
    }

    /// Remove a statement from the cache.
    pub fn remove(&mut self, key: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.as_mut()?.pop(key)
    }

    /// Generate a unique statement name for this connection.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id += 1;
        format!("__pgkit_{}", self.next_id)
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        // Default capacity of 100 statements per connection
        Self::new(100)
    }
}
