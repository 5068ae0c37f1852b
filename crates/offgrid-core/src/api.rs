//! Client for the backend's JSON envelope endpoint.
//!
//! Lookups are `GET <api>?sheet=<endpoint>&<params>` answered with
//! `{ "ok": true, "data": ... }` or `{ "ok": false, "error": "..." }`.
//! Every request goes through the [`Interceptor`], so reads get offline
//! fallback for free; [`ApiClient::sheet`] additionally de-duplicates
//! lookups through the [`SessionCache`].

use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::http::{Request, Response};
use crate::intercept::Interceptor;
use crate::session::{SessionCache, SessionKey};

/// Query parameter naming the logical resource.
const SHEET_PARAM: &str = "sheet";

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Clone is cheap - the interceptor and session cache are shared handles.
#[derive(Clone)]
pub struct ApiClient {
    interceptor: Interceptor,
    session: SessionCache,
    endpoint: Url,
}

impl ApiClient {
    pub fn new(interceptor: Interceptor, session: SessionCache, endpoint: Url) -> Self {
        Self {
            interceptor,
            session,
            endpoint,
        }
    }

    pub fn session(&self) -> &SessionCache {
        &self.session
    }

    fn sheet_url(&self, key: &SessionKey) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(SHEET_PARAM, key.endpoint());
            for (name, value) in key.params() {
                query.append_pair(name, value);
            }
        }
        url
    }

    /// Fetch a sheet through the interceptor, bypassing the session cache.
    pub async fn get_json(&self, key: &SessionKey) -> Result<Value, FetchError> {
        let request =
            Request::get(self.sheet_url(key)).with_header("accept", "application/json");
        let response = self.interceptor.handle(request).await;
        debug!(sheet = %key, status = response.status, source = ?response.source, "Sheet response");
        Self::unwrap_envelope(response)
    }

    /// Fetch a sheet, sharing live records and in-flight lookups.
    pub async fn sheet(&self, key: impl Into<SessionKey>) -> Result<Value, FetchError> {
        let key = key.into();
        let client = self.clone();
        let lookup = key.clone();
        self.session
            .get_or_fetch(key, move || async move { client.get_json(&lookup).await })
            .await
    }

    /// Send a mutating request. Never cached, never answered from cache.
    pub async fn post_json(&self, action: &str, body: &Value) -> Result<Value, FetchError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("action", action);
        let body = serde_json::to_vec(body)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        let request = Request::new(Method::POST, url)
            .with_header("content-type", "application/json")
            .with_header("accept", "application/json")
            .with_body(body);
        Self::unwrap_envelope(self.interceptor.handle(request).await)
    }

    fn unwrap_envelope(response: Response) -> Result<Value, FetchError> {
        if response.is_offline() {
            return Err(FetchError::Offline);
        }
        // Non-2xx is a failure whatever the envelope says
        if !response.is_success() {
            return Err(FetchError::from_status(response.status, &response.text()));
        }
        let envelope: Envelope = response
            .json()
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        if envelope.ok {
            Ok(envelope.data.unwrap_or(Value::Null))
        } else {
            Err(FetchError::Upstream {
                status: response.status,
                message: envelope
                    .error
                    .unwrap_or_else(|| "unspecified error".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::watch;

    use crate::config::SessionTtlConfig;
    use crate::policy::PolicyRouter;
    use crate::store::MemoryStore;
    use crate::testing::ScriptedTransport;

    struct Fixture {
        client: ApiClient,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
        _active: watch::Sender<Option<String>>,
    }

    fn fixture() -> Fixture {
        let base = Url::parse("https://league.example.org/").unwrap();
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let (tx, rx) = watch::channel(Some("app-cache-v1".to_string()));
        let interceptor = Interceptor::new(
            PolicyRouter::new("/assets/"),
            store.clone(),
            transport.clone(),
            rx,
            &base.join("/index.html").unwrap(),
        );
        let client = ApiClient::new(
            interceptor,
            SessionCache::new("v1", SessionTtlConfig::default()),
            base.join("/api").unwrap(),
        );
        Fixture {
            client,
            transport,
            store,
            _active: tx,
        }
    }

    #[test]
    fn test_sheet_url_carries_name_and_params() {
        let f = fixture();
        let url = f
            .client
            .sheet_url(&SessionKey::new("standings").param("division", "U9"));
        assert_eq!(
            url.as_str(),
            "https://league.example.org/api?sheet=standings&division=U9"
        );
    }

    #[tokio::test]
    async fn test_ok_envelope_yields_data() {
        let f = fixture();
        f.transport
            .route("GET", "/api", 200, r#"{"ok":true,"data":{"rows":[1]}}"#);
        let data = f.client.get_json(&SessionKey::new("standings")).await.unwrap();
        assert_eq!(data, json!({"rows": [1]}));
    }

    #[tokio::test]
    async fn test_error_envelope_is_upstream_error() {
        let f = fixture();
        f.transport
            .route("GET", "/api", 200, r#"{"ok":false,"error":"unknown sheet"}"#);
        let err = f.client.get_json(&SessionKey::new("nope")).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Upstream {
                status: 200,
                message: "unknown sheet".into()
            }
        );
    }

    #[tokio::test]
    async fn test_non_2xx_fails_even_with_ok_envelope() {
        let f = fixture();
        f.transport.route("GET", "/api", 500, r#"{"ok":true,"data":1}"#);
        let err = f.client.get_json(&SessionKey::new("standings")).await.unwrap_err();
        assert!(matches!(err, FetchError::Upstream { status: 500, .. }));
        assert_eq!(f.store.len("app-cache-v1").await, 0);
    }

    #[tokio::test]
    async fn test_offline_is_distinguishable_from_upstream_503() {
        let f = fixture();
        f.transport.route("GET", "/api", 503, "maintenance");
        let upstream = f.client.get_json(&SessionKey::new("standings")).await.unwrap_err();
        assert!(matches!(upstream, FetchError::Upstream { status: 503, .. }));

        f.transport.set_offline(true);
        let offline = f.client.get_json(&SessionKey::new("standings")).await.unwrap_err();
        assert_eq!(offline, FetchError::Offline);
    }

    #[tokio::test]
    async fn test_sheet_reads_survive_going_offline() {
        let f = fixture();
        f.transport
            .route("GET", "/api", 200, r#"{"ok":true,"data":["Hawks","Owls"]}"#);
        let online = f.client.sheet("standings:U9").await.unwrap();

        // Fresh session cache, same disk cache: served by the interceptor fallback
        f.client.session().invalidate_all().await;
        f.transport.set_offline(true);
        let offline = f.client.sheet("standings:U9").await.unwrap();
        assert_eq!(online, offline);
    }

    #[tokio::test]
    async fn test_sheet_uses_session_cache() {
        let f = fixture();
        f.transport.route("GET", "/api", 200, r#"{"ok":true,"data":1}"#);
        f.client.sheet("schedule").await.unwrap();
        f.client.sheet("schedule").await.unwrap();
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_post_is_never_cached() {
        let f = fixture();
        f.transport.route("POST", "/api", 200, r#"{"ok":true,"data":"saved"}"#);
        let saved = f
            .client
            .post_json("score", &json!({"game": 7, "home": 2, "away": 1}))
            .await
            .unwrap();
        assert_eq!(saved, json!("saved"));
        assert_eq!(f.store.len("app-cache-v1").await, 0);

        f.transport.set_offline(true);
        let err = f.client.post_json("score", &json!({})).await.unwrap_err();
        assert_eq!(err, FetchError::Offline);
    }
}
