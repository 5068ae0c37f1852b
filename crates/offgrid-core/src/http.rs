//! Request and response values passed through the interception layer.
//!
//! These are plain owned values rather than `reqwest` types so that cached
//! entries, synthesized responses and live network responses all share one
//! shape.

use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;

use crate::store::{age_display, CacheEntry};

/// Body returned to callers when neither network nor cache can answer.
pub const OFFLINE_BODY: &str = r#"{"ok":false,"error":"offline"}"#;

/// Status of the synthesized offline response.
pub const OFFLINE_STATUS: u16 = 503;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    navigate: bool,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            navigate: false,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// A full-page navigation (eligible for the app shell fallback).
    pub fn navigation(url: Url) -> Self {
        Self {
            navigate: true,
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// GET and HEAD are safe to cache and replay.
    pub fn is_idempotent(&self) -> bool {
        is_idempotent(&self.method)
    }

    /// Explicit navigations, or GETs that ask for an HTML document.
    pub fn is_navigation(&self) -> bool {
        if self.navigate {
            return true;
        }
        self.method == Method::GET
            && self
                .header("accept")
                .map(|accept| accept.contains("text/html"))
                .unwrap_or(false)
    }
}

pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// Where a response handed back by the interceptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Cached application shell substituted for a navigation
    Shell,
    /// Synthesized; neither network nor cache could answer
    Offline,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
    /// When the body was stored, for responses served from cache
    pub stored_at: Option<DateTime<Utc>>,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            source: ResponseSource::Network,
            stored_at: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            status: OFFLINE_STATUS,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: OFFLINE_BODY.as_bytes().to_vec(),
            source: ResponseSource::Offline,
            stored_at: None,
        }
    }

    pub fn from_entry(entry: CacheEntry, source: ResponseSource) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            source,
            stored_at: Some(entry.stored_at),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Successful, and not a JSON envelope reporting `"ok": false`.
    pub fn is_cacheable(&self) -> bool {
        self.is_success() && !self.is_error_envelope()
    }

    fn is_error_envelope(&self) -> bool {
        let is_json = self
            .header("content-type")
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        if !is_json {
            return false;
        }
        match serde_json::from_slice::<serde_json::Value>(&self.body) {
            Ok(value) => value.get("ok") == Some(&serde_json::Value::Bool(false)),
            Err(_) => false,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.source == ResponseSource::Offline
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// e.g. `"5m ago"` for responses served from cache.
    pub fn age_display(&self) -> Option<String> {
        self.stored_at
            .map(|at| age_display((Utc::now() - at).num_minutes()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
