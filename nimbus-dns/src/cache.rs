//! DNS response caching with TTL expiration
//!
//! Responses are stored verbatim as returned by upstream and keyed by the
//! question fingerprint (name lowercased, type, class), so the same query is
//! recognized across different transaction IDs. Entries expire by TTL; an
//! insert for an existing key replaces the previous entry.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use hickory_proto::op::Query;
use hickory_proto::rr::{DNSClass, RecordType};

/// Minimum TTL applied on insert (prevents cache churn)
pub const MIN_TTL_SECS: u64 = 1;

/// Maximum TTL applied on insert (prevents stale entries)
pub const MAX_TTL_SECS: u64 = 3600;

/// Cache key for DNS questions
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheKey {
    /// Question name (lowercased)
    name: String,
    /// Question type (A, AAAA, etc.)
    qtype: RecordType,
    /// Question class (almost always IN)
    qclass: DNSClass,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        u16::from(self.qtype).hash(state);
        u16::from(self.qclass).hash(state);
    }
}

impl CacheKey {
    /// Create a cache key from a DNS question
    pub fn from_query(query: &Query) -> Self {
        Self {
            name: query.name().to_string().to_lowercase(),
            qtype: query.query_type(),
            qclass: query.query_class(),
        }
    }

    /// The lowercased question name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The question type
    pub fn qtype(&self) -> RecordType {
        self.qtype
    }
}

/// Cached DNS response
#[derive(Debug, Clone)]
struct CacheEntry {
    /// The response bytes as returned by upstream
    response: Vec<u8>,
    /// When this entry expires
    expires_at: Instant,
}

impl CacheEntry {
    fn new(response: Vec<u8>, ttl: Duration) -> Self {
        Self {
            response,
            expires_at: Instant::now() + ttl,
        }
    }
}

/// DNS response cache with TTL expiration
///
/// When constructed disabled, lookups always miss and inserts are no-ops;
/// `prune` and `len` keep working and report an empty cache.
pub struct DnsCache {
    entries: HashMap<CacheKey, CacheEntry>,
    enabled: bool,
}

impl DnsCache {
    /// Create a new cache
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: HashMap::new(),
            enabled,
        }
    }

    /// Look up a cached response
    ///
    /// Returns the response bytes and the remaining TTL in seconds. Never
    /// returns an expired entry; expired entries found here are removed.
    pub fn lookup(&mut self, key: &CacheKey) -> Option<(Vec<u8>, u64)> {
        if !self.enabled {
            return None;
        }

        if let Some(entry) = self.entries.get(key) {
            let remaining = entry.expires_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.entries.remove(key);
                return None;
            }
            return Some((entry.response.clone(), remaining.as_secs().max(1)));
        }
        None
    }

    /// Insert a response, replacing any previous entry for the same question
    ///
    /// The TTL is clamped into [`MIN_TTL_SECS`, `MAX_TTL_SECS`].
    pub fn insert(&mut self, key: CacheKey, response: &[u8], ttl_secs: u64) {
        if !self.enabled {
            return;
        }

        let ttl = ttl_secs.clamp(MIN_TTL_SECS, MAX_TTL_SECS);
        self.entries.insert(
            key,
            CacheEntry::new(response.to_vec(), Duration::from_secs(ttl)),
        );
    }

    /// Remove all expired entries, returning how many were removed
    pub fn prune(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Number of entries currently cached
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
