use thiserror::Error;

/// Maximum length for upstream response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Failure reaching the backend at all.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Outcome of a failed application-level lookup.
///
/// `Clone` so that a single settled fetch can be handed to every
/// coalesced waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Offline - network unavailable and nothing cached")]
    Offline,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        FetchError::Upstream {
            status,
            message: Self::truncate_body(body),
        }
    }

    /// True for failures that mean "could not get an answer at all",
    /// as opposed to the backend answering with a failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Offline)
    }
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        FetchError::Network(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Storage quota exceeded ({limit} entries)")]
    QuotaExceeded { limit: usize },

    #[error("Invalid namespace name: {0}")]
    InvalidNamespace(String),

    #[error("Refusing to cache non-idempotent {0} request")]
    NotCacheable(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Install failed for {path}: {reason}")]
    InstallFailure { path: String, reason: String },

    #[error("Namespace {0} is not fully installed")]
    NotInstalled(String),

    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid URL {value}: {reason}")]
    InvalidUrl { value: String, reason: String },
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Runtime already initialized - call shutdown() first")]
    AlreadyInitialized,

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),
}
