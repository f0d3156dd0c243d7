//! Response cache for non-streaming requests
//!
//! Keys are SHA-256 fingerprints of the upstream request with the concrete
//! model replaced by the model category, so equivalent requests hit the same
//! entry whichever provider served them first. A cache that cannot answer is
//! treated as a miss.

use crate::cli::CacheConfig;
use crate::mapper::ModelCategory;
use crate::models::openai::{OpenAIRequest, OpenAIResponse};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cache collaborator
pub trait ResponseCache: Send + Sync {
    fn get(&self, fingerprint: &str) -> Option<OpenAIResponse>;

    fn put(&self, fingerprint: &str, response: &OpenAIResponse, ttl: Duration);
}

/// Fingerprint an upstream request for caching
pub fn fingerprint(request: &OpenAIRequest, category: &ModelCategory) -> Option<String> {
    let mut keyed = request.clone();
    keyed.model = category.to_string();

    let bytes = serde_json::to_vec(&keyed).ok()?;
    Some(format!("{:x}", Sha256::digest(&bytes)))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: OpenAIResponse,
    expires_at: Instant,
}

/// In-process TTL cache
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; if still full, drop the entry closest to expiry
    fn make_room(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);

        if self.entries.len() < self.max_entries {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, fingerprint: &str) -> Option<OpenAIResponse> {
        let entry = self.entries.get(fingerprint)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(fingerprint);
            return None;
        }
        Some(entry.response.clone())
    }

    fn put(&self, fingerprint: &str, response: &OpenAIResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(fingerprint) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                response: response.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Build the configured cache, if enabled
pub fn from_config(config: &CacheConfig) -> Option<Arc<dyn ResponseCache>> {
    if !config.enabled {
        return None;
    }
    tracing::info!(
        "Response cache enabled (ttl {}s, max {} entries)",
        config.ttl_secs,
        config.max_entries
    );
    Some(Arc::new(MemoryCache::new(config.max_entries)))
}
