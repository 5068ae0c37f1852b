//! Build lifecycle: precache a build's namespace, then cut over to it and
//! retire every older namespace.
//!
//! Phases for the current build: `Idle -> Installing -> Installed ->
//! Activating -> Active`. Any namespace of this application other than the
//! current build's is superseded and gets deleted on the next activation.
//!
//! Installation is all-or-nothing. Every manifest asset is fetched before
//! anything is written, and a failed write removes the half-built namespace,
//! so a partial precache is never activated. Activation is not cancellable;
//! if it is interrupted, `start` finds the current build's namespace on the
//! next launch and resumes from there (or reinstalls if it is incomplete).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::Url;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::LifecycleError;
use crate::http::Request;
use crate::store::{CacheEntry, CacheKey, CacheStore};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Installing,
    Installed,
    Activating,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceStatus {
    /// Serving requests
    Active,
    /// The current build's namespace, installed but not yet activated
    Installed,
    /// Left over from another build; deleted on the next activation
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub name: String,
    pub version: String,
    pub status: NamespaceStatus,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub namespace: String,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub namespace: String,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// `None` when an already complete namespace was reused
    pub install: Option<InstallReport>,
    pub activation: ActivationReport,
}

pub struct LifecycleManager {
    namespace: String,
    prefix: String,
    /// (manifest path, resolved URL)
    manifest: Vec<(String, Url)>,
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    active: watch::Sender<Option<String>>,
    phase: watch::Sender<LifecyclePhase>,
    /// Serializes install/activate/purge
    transition: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        config: &Config,
        store: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, LifecycleError> {
        config.validate()?;
        let manifest = config
            .precache
            .iter()
            .map(|path| -> Result<(String, Url), LifecycleError> {
                Ok((path.clone(), config.resolve(path)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (active, _) = watch::channel(None);
        let (phase, _) = watch::channel(LifecyclePhase::Idle);
        Ok(Self {
            namespace: config.namespace(),
            prefix: config.namespace_prefix(),
            manifest,
            store,
            transport,
            active,
            phase,
            transition: Mutex::new(()),
        })
    }

    /// The current build's namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.borrow()
    }

    /// Receiver that always holds the namespace currently serving requests.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.active.subscribe()
    }

    pub fn active_namespace(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    /// Install if needed, then activate. Called once at process start.
    pub async fn start(&self) -> Result<StartReport, LifecycleError> {
        let _guard = self.transition.lock().await;

        let install = if self.is_installed().await {
            debug!(namespace = %self.namespace, "Reusing installed namespace");
            None
        } else {
            match self.install_locked().await {
                Ok(report) => Some(report),
                Err(e) => {
                    self.retain_previous().await;
                    return Err(e);
                }
            }
        };
        let activation = self.activate_locked().await?;
        Ok(StartReport {
            install,
            activation,
        })
    }

    pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
        let _guard = self.transition.lock().await;
        self.install_locked().await
    }

    pub async fn activate(&self) -> Result<ActivationReport, LifecycleError> {
        let _guard = self.transition.lock().await;
        self.activate_locked().await
    }

    /// True when every manifest asset is present in the current namespace.
    pub async fn is_installed(&self) -> bool {
        for (path, url) in &self.manifest {
            match self.store.get(&self.namespace, &CacheKey::get(url)).await {
                Ok(Some(_)) => {}
                Ok(None) => return false,
                Err(e) => {
                    warn!(namespace = %self.namespace, path = %path, error = %e, "Unreadable precache entry");
                    return false;
                }
            }
        }
        true
    }

    async fn install_locked(&self) -> Result<InstallReport, LifecycleError> {
        let previous = self.phase();
        self.phase.send_replace(LifecyclePhase::Installing);
        info!(namespace = %self.namespace, assets = self.manifest.len(), "Installing");

        let fetches = self
            .manifest
            .iter()
            .map(|(path, url)| self.fetch_asset(path, url));
        let entries = match try_join_all(fetches).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Install failed, nothing written");
                self.phase.send_replace(previous);
                return Err(e);
            }
        };

        let count = entries.len();
        for entry in entries {
            let url = entry.key.url.clone();
            if let Err(e) = self.store.put(&self.namespace, entry).await {
                warn!(namespace = %self.namespace, url = %url, error = %e, "Install write failed, rolling back");
                self.discard_partial().await;
                self.phase.send_replace(previous);
                return Err(LifecycleError::InstallFailure {
                    path: url,
                    reason: e.to_string(),
                });
            }
        }

        // Reinstalling the live namespace keeps it live
        if previous != LifecyclePhase::Active {
            self.phase.send_replace(LifecyclePhase::Installed);
        } else {
            self.phase.send_replace(previous);
        }
        info!(namespace = %self.namespace, entries = count, "Installed");
        Ok(InstallReport {
            namespace: self.namespace.clone(),
            entries: count,
        })
    }

    async fn fetch_asset(&self, path: &str, url: &Url) -> Result<CacheEntry, LifecycleError> {
        let response = self
            .transport
            .fetch(&Request::get(url.clone()))
            .await
            .map_err(|e| LifecycleError::InstallFailure {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        if !response.is_success() {
            return Err(LifecycleError::InstallFailure {
                path: path.to_string(),
                reason: format!("status {}", response.status),
            });
        }
        Ok(CacheEntry::from_response(CacheKey::get(url), &response))
    }

    async fn discard_partial(&self) {
        if self.active_namespace().as_deref() == Some(self.namespace.as_str()) {
            return;
        }
        if let Err(e) = self.store.delete_namespace(&self.namespace).await {
            warn!(namespace = %self.namespace, error = %e, "Failed to remove partial namespace");
        }
    }

    /// After a failed install, keep serving from the namespace an earlier
    /// build left active. Activation leaves at most one behind; if an
    /// interrupted activation left several, the most recently written wins.
    async fn retain_previous(&self) {
        if self.active_namespace().is_some() {
            return;
        }
        let names = match self.store.namespaces().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Could not list namespaces");
                return;
            }
        };

        let mut previous: Option<(Option<DateTime<Utc>>, String)> = None;
        for name in names {
            if !name.starts_with(&self.prefix) || name == self.namespace {
                continue;
            }
            let written = self.last_written(&name).await;
            if previous.as_ref().map_or(true, |(best, _)| written > *best) {
                previous = Some((written, name));
            }
        }

        if let Some((_, name)) = previous {
            info!(namespace = %name, "Previous namespace remains in control");
            self.active.send_replace(Some(name));
        }
    }

    /// Newest `stored_at` among a namespace's readable entries.
    async fn last_written(&self, namespace: &str) -> Option<DateTime<Utc>> {
        let keys = self.store.keys(namespace).await.ok()?;
        let mut newest = None;
        for key in keys {
            if let Ok(Some(entry)) = self.store.get(namespace, &key).await {
                newest = newest.max(Some(entry.stored_at));
            }
        }
        newest
    }

    async fn activate_locked(&self) -> Result<ActivationReport, LifecycleError> {
        if !self.is_installed().await {
            return Err(LifecycleError::NotInstalled(self.namespace.clone()));
        }
        let existing = self.store.namespaces().await?;

        self.phase.send_replace(LifecyclePhase::Activating);
        let mut deleted = Vec::new();
        for name in existing {
            if !name.starts_with(&self.prefix) || name == self.namespace {
                continue;
            }
            match self.store.delete_namespace(&name).await {
                Ok(true) => {
                    info!(namespace = %name, "Deleted superseded namespace");
                    deleted.push(name);
                }
                Ok(false) => {}
                // Retried on the next activation
                Err(e) => warn!(namespace = %name, error = %e, "Failed to delete superseded namespace"),
            }
        }

        // Claim: interceptors pick this up on their next request
        self.active.send_replace(Some(self.namespace.clone()));
        self.phase.send_replace(LifecyclePhase::Active);
        info!(namespace = %self.namespace, deleted = deleted.len(), "Activated");

        Ok(ActivationReport {
            namespace: self.namespace.clone(),
            deleted,
        })
    }

    /// This application's namespaces, each with its status and entry count.
    pub async fn namespaces(&self) -> Result<Vec<NamespaceInfo>, LifecycleError> {
        let active = self.active_namespace();
        let mut infos = Vec::new();
        for name in self.store.namespaces().await? {
            let Some(version) = name.strip_prefix(&self.prefix) else {
                continue;
            };
            let status = if active.as_deref() == Some(name.as_str()) {
                NamespaceStatus::Active
            } else if name == self.namespace {
                NamespaceStatus::Installed
            } else {
                NamespaceStatus::Superseded
            };
            let entries = self.store.keys(&name).await?.len();
            infos.push(NamespaceInfo {
                version: version.to_string(),
                name,
                status,
                entries,
            });
        }
        Ok(infos)
    }

    /// Delete every namespace this application owns, including the active one.
    pub async fn purge(&self) -> Result<Vec<String>, LifecycleError> {
        let _guard = self.transition.lock().await;
        self.active.send_replace(None);
        self.phase.send_replace(LifecyclePhase::Idle);

        let mut deleted = Vec::new();
        for name in self.store.namespaces().await? {
            if name.starts_with(&self.prefix) && self.store.delete_namespace(&name).await? {
                deleted.push(name);
            }
        }
        info!(deleted = deleted.len(), "Purged cache namespaces");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::store::MemoryStore;
    use crate::testing::ScriptedTransport;

    fn config(version: &str) -> Config {
        Config {
            app_id: "app".into(),
            build_version: version.into(),
            base_url: "https://league.example.org/".into(),
            precache: vec!["/".into(), "/index.html".into()],
            ..Config::default()
        }
    }

    fn serving_transport() -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route("GET", "/", 200, "<html>home</html>");
        transport.route("GET", "/index.html", 200, "<html>shell</html>");
        transport
    }

    fn manager(
        version: &str,
        store: &Arc<MemoryStore>,
        transport: &Arc<ScriptedTransport>,
    ) -> LifecycleManager {
        LifecycleManager::new(&config(version), store.clone(), transport.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_install_activate_then_supersede() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();

        let v1 = manager("v1", &store, &transport);
        let installed = v1.install().await.unwrap();
        assert_eq!(installed.namespace, "app-cache-v1");
        assert_eq!(installed.entries, 2);
        assert_eq!(store.len("app-cache-v1").await, 2);
        assert_eq!(v1.phase(), LifecyclePhase::Installed);

        let activated = v1.activate().await.unwrap();
        assert!(activated.deleted.is_empty());
        assert_eq!(v1.active_namespace().as_deref(), Some("app-cache-v1"));
        assert_eq!(v1.phase(), LifecyclePhase::Active);

        let v2 = manager("v2", &store, &transport);
        v2.install().await.unwrap();
        let statuses: Vec<_> = v2
            .namespaces()
            .await
            .unwrap()
            .into_iter()
            .map(|info| (info.version, info.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("v1".to_string(), NamespaceStatus::Superseded),
                ("v2".to_string(), NamespaceStatus::Installed),
            ]
        );

        let activated = v2.activate().await.unwrap();
        assert_eq!(activated.deleted, vec!["app-cache-v1".to_string()]);
        assert_eq!(store.namespaces().await.unwrap(), vec!["app-cache-v2"]);
    }

    #[tokio::test]
    async fn test_failed_install_leaves_previous_namespace_in_control() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();
        let v1 = manager("v1", &store, &transport);
        v1.start().await.unwrap();

        transport.break_path("/index.html");
        let v2 = manager("v2", &store, &transport);
        let err = v2.install().await.unwrap_err();
        match err {
            LifecycleError::InstallFailure { path, .. } => assert_eq!(path, "/index.html"),
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(v2.phase(), LifecyclePhase::Idle);
        assert_eq!(store.namespaces().await.unwrap(), vec!["app-cache-v1"]);
        assert!(matches!(
            v2.activate().await,
            Err(LifecycleError::NotInstalled(_))
        ));
        assert_eq!(store.namespaces().await.unwrap(), vec!["app-cache-v1"]);
    }

    #[tokio::test]
    async fn test_failed_start_keeps_serving_previous_build() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();
        manager("v1", &store, &transport).start().await.unwrap();

        // New process, new build, backend half down
        transport.break_path("/");
        let v2 = manager("v2", &store, &transport);
        assert!(v2.start().await.is_err());
        assert_eq!(v2.active_namespace().as_deref(), Some("app-cache-v1"));
        assert_eq!(v2.phase(), LifecyclePhase::Idle);

        let statuses: Vec<_> = v2
            .namespaces()
            .await
            .unwrap()
            .into_iter()
            .map(|info| (info.name, info.status))
            .collect();
        assert_eq!(
            statuses,
            vec![("app-cache-v1".to_string(), NamespaceStatus::Active)]
        );
    }

    #[tokio::test]
    async fn test_failed_start_prefers_most_recently_written_namespace() {
        let store = Arc::new(MemoryStore::new());
        let home = Response::new(200, vec![], b"<html>home</html>".to_vec());
        let url = Url::parse("https://league.example.org/").unwrap();
        for (namespace, minutes_ago) in [("app-cache-v9", 90), ("app-cache-v10", 5)] {
            let mut entry = CacheEntry::from_response(CacheKey::get(&url), &home);
            entry.stored_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
            store.put(namespace, entry).await.unwrap();
        }

        let transport = serving_transport();
        transport.break_path("/");
        let v11 = manager("v11", &store, &transport);
        assert!(v11.start().await.is_err());
        // v10 sorts before v9 by name but was written last
        assert_eq!(v11.active_namespace().as_deref(), Some("app-cache-v10"));
    }

    #[tokio::test]
    async fn test_non_success_asset_fails_install() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        transport.route("GET", "/", 200, "home");
        // /index.html is unrouted and answers 404
        let v1 = manager("v1", &store, &transport);
        assert!(matches!(
            v1.install().await,
            Err(LifecycleError::InstallFailure { .. })
        ));
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_rolls_back_partial_namespace() {
        let store = Arc::new(MemoryStore::with_quota(1));
        let transport = serving_transport();
        let v1 = manager("v1", &store, &transport);
        assert!(matches!(
            v1.install().await,
            Err(LifecycleError::InstallFailure { .. })
        ));
        assert!(store.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_reuses_complete_namespace() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();
        manager("v1", &store, &transport).install().await.unwrap();
        let calls = transport.calls();

        // Simulates a restart after a crash mid-activation
        let restarted = manager("v1", &store, &transport);
        let report = restarted.start().await.unwrap();
        assert!(report.install.is_none());
        assert_eq!(transport.calls(), calls);
        assert_eq!(restarted.phase(), LifecyclePhase::Active);
    }

    #[tokio::test]
    async fn test_start_reinstalls_incomplete_namespace() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();
        let home = Url::parse("https://league.example.org/").unwrap();
        store
            .put(
                "app-cache-v1",
                CacheEntry::from_response(
                    CacheKey::get(&home),
                    &Response::new(200, vec![], b"home".to_vec()),
                ),
            )
            .await
            .unwrap();

        let v1 = manager("v1", &store, &transport);
        assert!(!v1.is_installed().await);
        let report = v1.start().await.unwrap();
        assert_eq!(report.install.map(|i| i.entries), Some(2));
        assert_eq!(store.len("app-cache-v1").await, 2);
    }

    #[tokio::test]
    async fn test_activation_notifies_subscribers_immediately() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();
        let v1 = manager("v1", &store, &transport);
        let mut rx = v1.subscribe();
        assert!(rx.borrow().is_none());

        v1.start().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_deref(), Some("app-cache-v1"));
    }

    #[tokio::test]
    async fn test_foreign_namespaces_survive_activation_but_purge_clears_own() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();
        let other_url = Url::parse("https://other.example.org/").unwrap();
        store
            .put(
                "otherapp-cache-v9",
                CacheEntry::from_response(
                    CacheKey::get(&other_url),
                    &Response::new(200, vec![], vec![]),
                ),
            )
            .await
            .unwrap();

        let v1 = manager("v1", &store, &transport);
        let report = v1.start().await.unwrap();
        assert!(report.activation.deleted.is_empty());
        assert_eq!(
            store.namespaces().await.unwrap(),
            vec!["app-cache-v1", "otherapp-cache-v9"]
        );

        assert_eq!(v1.purge().await.unwrap(), vec!["app-cache-v1".to_string()]);
        assert_eq!(v1.active_namespace(), None);
        assert_eq!(v1.phase(), LifecyclePhase::Idle);
        assert_eq!(store.namespaces().await.unwrap(), vec!["otherapp-cache-v9"]);
    }

    #[tokio::test]
    async fn test_reinstall_while_active_stays_active() {
        let store = Arc::new(MemoryStore::new());
        let transport = serving_transport();
        let v1 = manager("v1", &store, &transport);
        v1.start().await.unwrap();
        v1.install().await.unwrap();
        assert_eq!(v1.phase(), LifecyclePhase::Active);
    }
}
