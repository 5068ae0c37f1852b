//! Maps a request to a caching strategy.
//!
//! Pure and deterministic: the decision depends only on method and path.

use reqwest::Method;

use crate::http::{self, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Immutable, content-hashed assets: serve from cache when present
    CacheFirst,
    /// Everything else idempotent: prefer fresh, fall back to cache
    NetworkFirst,
    /// Mutating requests: never touch the cache
    NoCache,
}

#[derive(Debug, Clone)]
pub struct PolicyRouter {
    asset_prefix: String,
}

impl PolicyRouter {
    pub fn new(asset_prefix: &str) -> Self {
        let mut prefix = asset_prefix.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            asset_prefix: prefix,
        }
    }

    pub fn classify(&self, request: &Request) -> Strategy {
        self.classify_parts(&request.method, request.path())
    }

    pub fn classify_parts(&self, method: &Method, path: &str) -> Strategy {
        if !http::is_idempotent(method) {
            Strategy::NoCache
        } else if path.starts_with(&self.asset_prefix) {
            Strategy::CacheFirst
        } else {
            Strategy::NetworkFirst
        }
    }
}
