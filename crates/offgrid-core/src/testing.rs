//! Scripted in-process transport for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::http::{Request, Response};
use crate::transport::Transport;

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    broken: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Respond to `<METHOD> <path>` with the given status and body.
    pub(crate) fn route(&self, method: &str, path: &str, status: u16, body: &str) {
        self.routes.lock().unwrap().insert(
            format!("{} {}", method, path),
            (status, body.as_bytes().to_vec()),
        );
    }

    /// Connection errors for one path only.
    pub(crate) fn break_path(&self, path: &str) {
        self.broken.lock().unwrap().insert(path.to_string());
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) || self.broken.lock().unwrap().contains(request.path()) {
            return Err(TransportError::Connect("network unreachable".into()));
        }
        let route = format!("{} {}", request.method, request.path());
        match self.routes.lock().unwrap().get(&route) {
            Some((status, body)) => Ok(Response::new(
                *status,
                vec![("content-type".into(), "application/json".into())],
                body.clone(),
            )),
            None => Ok(Response::new(404, vec![], b"not found".to_vec())),
        }
    }
}
