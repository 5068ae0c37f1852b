//! Per-session cache of parsed application responses.
//!
//! Records are keyed by (build version, endpoint, sorted params), so a new
//! build never reads an older build's records. Concurrent lookups of the
//! same key share one fetch: the first caller to find the key absent
//! registers a shared future under the lock, everyone after it attaches.
//!
//! Per key: `Absent -> Pending -> {Populated | Absent}`, and
//! `Populated -> Absent` on expiry or invalidation. Expired records are
//! dropped when a lookup finds them and swept on every miss.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use url::form_urlencoded;

use crate::config::SessionTtlConfig;
use crate::error::FetchError;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// (build version, lookup key)
type SlotKey = (Arc<str>, SessionKey);

/// Logical lookup identity before it is scoped to a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    endpoint: String,
    params: BTreeMap<String, String>,
}

impl SessionKey {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_params<I, K, V>(endpoint: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            endpoint: endpoint.into(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `endpoint` or `endpoint?a=1&b=2`, params sorted and form-encoded.
    /// A `?` inside the endpoint is escaped so it never reads as the separator.
    fn canonical(&self) -> String {
        let endpoint = self.endpoint.replace('%', "%25").replace('?', "%3F");
        if self.params.is_empty() {
            return endpoint;
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.params)
            .finish();
        format!("{}?{}", endpoint, query)
    }

    /// Printable record identity for one build, e.g. `v1:standings?division=U9`.
    /// Records themselves are keyed on the structured key, not this string.
    pub fn scoped(&self, build_version: &str) -> String {
        format!("{}:{}", build_version, self.canonical())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<&str> for SessionKey {
    fn from(endpoint: &str) -> Self {
        Self::new(endpoint)
    }
}

impl From<String> for SessionKey {
    fn from(endpoint: String) -> Self {
        Self::new(endpoint)
    }
}

enum Slot {
    Ready { payload: Value, expires_at: Instant },
    Pending { id: u64, outcome: SharedFetch },
}

#[derive(Default)]
struct Slots {
    map: HashMap<SlotKey, Slot>,
    next_id: u64,
}

impl Slots {
    /// Record a fetch outcome, unless the pending registration it belongs
    /// to was invalidated or already settled.
    fn settle(&mut self, key: SlotKey, id: u64, ttl: Duration, result: &Result<Value, FetchError>) {
        let ours = matches!(
            self.map.get(&key),
            Some(Slot::Pending { id: pending, .. }) if *pending == id
        );
        if !ours {
            return;
        }
        match result {
            Ok(payload) if !ttl.is_zero() => {
                self.map.insert(
                    key,
                    Slot::Ready {
                        payload: payload.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
            }
            Ok(_) => {
                self.map.remove(&key);
            }
            Err(e) => {
                debug!(key = %key.1, error = %e, "Fetch failed, nothing cached");
                self.map.remove(&key);
            }
        }
    }

    fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::Pending { .. } => true,
        });
        before - self.map.len()
    }

    /// The payload of an unexpired record. An expired record found here is
    /// dropped.
    fn live(&mut self, key: &SlotKey) -> Option<(Value, Instant)> {
        let expires_at = match self.map.get(key) {
            Some(Slot::Ready { expires_at, .. }) => *expires_at,
            _ => return None,
        };
        if expires_at <= Instant::now() {
            self.map.remove(key);
            return None;
        }
        match self.map.get(key) {
            Some(Slot::Ready { payload, .. }) => Some((payload.clone(), expires_at)),
            _ => None,
        }
    }
}

enum Lookup {
    Hit(Value),
    Attach(SharedFetch),
    Miss,
}

/// Clone is cheap and clones share the same records.
#[derive(Clone)]
pub struct SessionCache {
    build_version: Arc<str>,
    ttl: Arc<SessionTtlConfig>,
    slots: Arc<Mutex<Slots>>,
}

impl SessionCache {
    pub fn new(build_version: &str, ttl: SessionTtlConfig) -> Self {
        Self {
            build_version: Arc::from(build_version),
            ttl: Arc::new(ttl),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// A view scoped to another build, sharing this cache's storage.
    pub fn for_build(&self, build_version: &str) -> Self {
        Self {
            build_version: Arc::from(build_version),
            ttl: Arc::clone(&self.ttl),
            slots: Arc::clone(&self.slots),
        }
    }

    fn slot_key(&self, key: &SessionKey) -> SlotKey {
        (Arc::clone(&self.build_version), key.clone())
    }

    /// Return a live record, join an in-flight fetch for the same key, or
    /// run `fetcher` and share its outcome. Failures are handed to every
    /// waiter and never cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: impl Into<SessionKey>,
        fetcher: F,
    ) -> Result<Value, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let key = key.into();
        let slot_key = self.slot_key(&key);
        let ttl = self.ttl.ttl_for(key.endpoint());

        let (outcome, owner_id) = {
            let mut slots = self.slots.lock().await;
            let pending = match slots.map.get(&slot_key) {
                Some(Slot::Pending { outcome, .. }) => Some(outcome.clone()),
                _ => None,
            };
            let lookup = match pending {
                Some(outcome) => Lookup::Attach(outcome),
                None => match slots.live(&slot_key) {
                    Some((payload, _)) => Lookup::Hit(payload),
                    None => Lookup::Miss,
                },
            };

            match lookup {
                Lookup::Hit(payload) => {
                    debug!(key = %slot_key.1, version = %slot_key.0, "Session cache hit");
                    return Ok(payload);
                }
                Lookup::Attach(outcome) => {
                    debug!(key = %slot_key.1, "Joining in-flight fetch");
                    (outcome, None)
                }
                Lookup::Miss => {
                    slots.sweep_expired();
                    let id = slots.next_id;
                    slots.next_id += 1;
                    let outcome = fetcher().boxed().shared();
                    slots.map.insert(
                        slot_key.clone(),
                        Slot::Pending {
                            id,
                            outcome: outcome.clone(),
                        },
                    );
                    self.settle_in_background(slot_key.clone(), id, ttl, outcome.clone());
                    debug!(key = %slot_key.1, "Session cache miss, fetching");
                    (outcome, Some(id))
                }
            }
        };

        let result = outcome.await;
        if let Some(id) = owner_id {
            // Settle before returning so the owner observes its own record
            self.slots.lock().await.settle(slot_key, id, ttl, &result);
        }
        result
    }

    /// Typed variant of [`get_or_fetch`](Self::get_or_fetch).
    pub async fn get_or_fetch_as<T, F, Fut>(
        &self,
        key: impl Into<SessionKey>,
        fetcher: F,
    ) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let value = self.get_or_fetch(key, fetcher).await?;
        serde_json::from_value(value).map_err(|e| FetchError::InvalidResponse(e.to_string()))
    }

    /// Drives the fetch to completion even if every caller goes away.
    fn settle_in_background(&self, slot_key: SlotKey, id: u64, ttl: Duration, outcome: SharedFetch) {
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let result = outcome.await;
            slots.lock().await.settle(slot_key, id, ttl, &result);
        });
    }

    /// The live payload for `key`, without fetching.
    pub async fn peek(&self, key: impl Into<SessionKey>) -> Option<Value> {
        let slot_key = self.slot_key(&key.into());
        let mut slots = self.slots.lock().await;
        slots.live(&slot_key).map(|(payload, _)| payload)
    }

    pub async fn ttl_remaining(&self, key: impl Into<SessionKey>) -> Option<Duration> {
        let slot_key = self.slot_key(&key.into());
        let mut slots = self.slots.lock().await;
        slots
            .live(&slot_key)
            .map(|(_, expires_at)| expires_at.saturating_duration_since(Instant::now()))
    }

    pub async fn invalidate(&self, key: impl Into<SessionKey>) -> bool {
        let slot_key = self.slot_key(&key.into());
        self.slots.lock().await.map.remove(&slot_key).is_some()
    }

    /// Drop every record of this build. Pending fetches are detached: their
    /// waiters still get the outcome but it is not stored. Records of other
    /// builds are unreachable and left alone.
    pub async fn invalidate_all(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let before = slots.map.len();
        slots
            .map
            .retain(|(version, _), _| *version != self.build_version);
        let removed = before - slots.map.len();
        debug!(version = %self.build_version, removed, "Invalidated session cache");
        removed
    }

    /// Remove expired records across all builds.
    pub async fn purge_expired(&self) -> usize {
        self.slots.lock().await.sweep_expired()
    }

    /// Live records across all builds.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .await
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { expires_at, .. } if *expires_at > now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
