//! Process-wide wiring of the caching layers.
//!
//! A [`Core`] is built once per client process from a [`Config`], started
//! (install if needed, then activate), and optionally registered as the
//! process singleton with [`init`] until [`shutdown`].

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::api::ApiClient;
use crate::config::Config;
use crate::error::{ConfigError, RuntimeError};
use crate::intercept::Interceptor;
use crate::lifecycle::{LifecycleManager, StartReport};
use crate::policy::PolicyRouter;
use crate::session::SessionCache;
use crate::store::{CacheStore, DiskStore};
use crate::transport::{HttpTransport, Transport};

static CURRENT: RwLock<Option<Arc<Core>>> = RwLock::new(None);

pub struct Core {
    config: Config,
    lifecycle: LifecycleManager,
    interceptor: Interceptor,
    session: SessionCache,
    api: ApiClient,
}

impl Core {
    /// Disk-backed store under the configured cache directory and a
    /// `reqwest` transport with the configured timeout.
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;
        let cache_dir = config
            .cache_dir()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let store = Arc::new(DiskStore::new(cache_dir)?);
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        Self::with_parts(config, store, transport)
    }

    pub fn with_parts(
        config: Config,
        store: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RuntimeError> {
        let lifecycle = LifecycleManager::new(&config, Arc::clone(&store), Arc::clone(&transport))?;
        let interceptor = Interceptor::new(
            PolicyRouter::new(&config.asset_prefix),
            store,
            transport,
            lifecycle.subscribe(),
            &config.resolve(&config.shell_path)?,
        );
        let session = SessionCache::new(&config.build_version, config.session_ttl.clone());
        let api = ApiClient::new(interceptor.clone(), session.clone(), config.api_url()?);

        Ok(Self {
            config,
            lifecycle,
            interceptor,
            session,
            api,
        })
    }

    /// Install the current build if needed and make it active.
    pub async fn start(&self) -> Result<StartReport, RuntimeError> {
        let report = self.lifecycle.start().await?;
        info!(
            namespace = %report.activation.namespace,
            installed = report.install.is_some(),
            deleted = report.activation.deleted.len(),
            "Offline cache ready"
        );
        Ok(report)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn session(&self) -> &SessionCache {
        &self.session
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }
}

/// Register `core` as the process singleton.
pub fn init(core: Core) -> Result<Arc<Core>, RuntimeError> {
    let mut current = CURRENT.write().unwrap_or_else(PoisonError::into_inner);
    if current.is_some() {
        return Err(RuntimeError::AlreadyInitialized);
    }
    let core = Arc::new(core);
    *current = Some(Arc::clone(&core));
    info!(build = %core.config.build_version, "Runtime initialized");
    Ok(core)
}

pub fn current() -> Option<Arc<Core>> {
    CURRENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Unregister the singleton. Handles already cloned from it stay usable.
pub fn shutdown() -> Option<Arc<Core>> {
    let previous = CURRENT
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if previous.is_some() {
        info!("Runtime shut down");
    }
    previous
}
