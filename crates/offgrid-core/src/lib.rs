//! Offline-first caching for a web client.
//!
//! Two cooperating layers:
//! - the [`Interceptor`] sits in front of the network and serves or refreshes
//!   cached responses according to the [`PolicyRouter`], backed by a
//!   namespaced [`CacheStore`] whose namespaces are managed per build by the
//!   [`LifecycleManager`];
//! - the [`SessionCache`] de-duplicates identical application lookups within
//!   one running session.
//!
//! The build version in [`Config`] scopes both layers, so bumping it
//! invalidates everything.

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod intercept;
pub mod lifecycle;
pub mod policy;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::ApiClient;
pub use config::{Config, SessionTtlConfig};
pub use error::{ConfigError, FetchError, LifecycleError, RuntimeError, StoreError, TransportError};
pub use http::{Request, Response, ResponseSource};
pub use intercept::Interceptor;
pub use lifecycle::{
    ActivationReport, InstallReport, LifecycleManager, LifecyclePhase, NamespaceInfo,
    NamespaceStatus, StartReport,
};
pub use policy::{PolicyRouter, Strategy};
pub use runtime::Core;
pub use session::{SessionCache, SessionKey};
pub use store::{CacheEntry, CacheKey, CacheStore, DiskStore, MemoryStore};
pub use transport::{HttpTransport, Transport};
