//! Request interception: applies the policy router's decision against the
//! cache store and the network.
//!
//! `handle` always produces a response. Transport failures degrade to a
//! cached copy, then to the app shell (navigations only), then to a
//! synthesized offline response. Cache writes are best effort and never
//! hold back a response that was already obtained.

use std::sync::Arc;

use reqwest::Url;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::http::{Request, Response, ResponseSource};
use crate::policy::{PolicyRouter, Strategy};
use crate::store::{CacheEntry, CacheKey, CacheStore};
use crate::transport::Transport;

#[derive(Clone)]
pub struct Interceptor {
    router: PolicyRouter,
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    /// Namespace published by the lifecycle manager on activation
    active: watch::Receiver<Option<String>>,
    shell: CacheKey,
}

impl Interceptor {
    pub fn new(
        router: PolicyRouter,
        store: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
        active: watch::Receiver<Option<String>>,
        shell_url: &Url,
    ) -> Self {
        Self {
            router,
            store,
            transport,
            active,
            shell: CacheKey::get(shell_url),
        }
    }

    pub fn active_namespace(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    pub async fn handle(&self, request: Request) -> Response {
        let strategy = self.router.classify(&request);
        debug!(method = %request.method, url = %request.url, ?strategy, "Intercepted request");

        match strategy {
            Strategy::NoCache => self.pass_through(&request).await,
            Strategy::CacheFirst => self.cache_first(&request).await,
            Strategy::NetworkFirst => self.network_first(&request).await,
        }
    }

    async fn pass_through(&self, request: &Request) -> Response {
        match self.transport.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(method = %request.method, url = %request.url, error = %e, "Network failure on uncached request");
                Response::offline()
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Response {
        let namespace = self.active_namespace();
        let key = CacheKey::for_request(request);

        if let Some(ref ns) = namespace {
            if let Some(entry) = self.lookup(ns, &key).await {
                debug!(url = %request.url, "Cache hit");
                return Response::from_entry(entry, ResponseSource::Cache);
            }
        }

        match self.transport.fetch(request).await {
            Ok(response) => {
                self.remember(namespace.as_deref(), key, &response).await;
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network failure on uncached asset");
                self.offline_fallback(request, namespace.as_deref()).await
            }
        }
    }

    async fn network_first(&self, request: &Request) -> Response {
        let namespace = self.active_namespace();
        let key = CacheKey::for_request(request);

        match self.transport.fetch(request).await {
            Ok(response) => {
                self.remember(namespace.as_deref(), key, &response).await;
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network failure, falling back to cache");
                if let Some(ref ns) = namespace {
                    if let Some(entry) = self.lookup(ns, &key).await {
                        return Response::from_entry(entry, ResponseSource::Cache);
                    }
                }
                self.offline_fallback(request, namespace.as_deref()).await
            }
        }
    }

    async fn offline_fallback(&self, request: &Request, namespace: Option<&str>) -> Response {
        if request.is_navigation() {
            if let Some(ns) = namespace {
                if let Some(shell) = self.lookup(ns, &self.shell).await {
                    debug!(url = %request.url, "Serving app shell for offline navigation");
                    return Response::from_entry(shell, ResponseSource::Shell);
                }
            }
        }
        Response::offline()
    }

    async fn lookup(&self, namespace: &str, key: &CacheKey) -> Option<CacheEntry> {
        match self.store.get(namespace, key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(namespace = namespace, url = %key.url, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn remember(&self, namespace: Option<&str>, key: CacheKey, response: &Response) {
        if !response.is_cacheable() {
            return;
        }
        let Some(namespace) = namespace else {
            debug!(url = %key.url, "No active namespace, response not cached");
            return;
        };
        let url = key.url.clone();
        if let Err(e) = self
            .store
            .put(namespace, CacheEntry::from_response(key, response))
            .await
        {
            warn!(namespace = namespace, url = %url, error = %e, "Cache write failed, returning response uncached");
        }
    }
}
