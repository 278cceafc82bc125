//! Access-control error model.

use thiserror::Error;

/// Result type used across the workspace.
pub type WardenResult<T> = Result<T, WardenError>;

/// Error taxonomy shared by every component.
///
/// Removing a tuple that does not exist is not an error; mutators return
/// `Ok(false)` for no-ops instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WardenError {
    /// Adding the edge would close a cycle in the domain's role graph.
    #[error("circular role dependency: {child} -> {parent} in {domain}")]
    CircularDependency {
        child: String,
        parent: String,
        domain: String,
    },

    /// Adding the edge would push the hierarchy past the configured depth.
    #[error("role hierarchy depth {level} exceeds max {max}")]
    MaxDepthExceeded { level: usize, max: usize },

    /// The distributed cache could not be reached.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// An invalidation event could not be delivered after all retries.
    #[error("invalidation delivery failed after {attempts} attempts: {reason}")]
    InvalidationDeliveryFailed { attempts: u32, reason: String },

    /// A bulk addition would exceed a tenant or role ceiling.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The blocking worker pool could not accept work in time. Retry-safe.
    #[error("worker pool saturated")]
    WorkerPoolSaturated,

    /// The durable policy store failed.
    #[error("policy store error: {0}")]
    Store(String),

    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A credential failed verification.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl WardenError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn cache_unavailable(msg: impl Into<String>) -> Self {
        Self::CacheUnavailable(msg.into())
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Whether the caller may retry the same operation unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WorkerPoolSaturated | Self::CacheUnavailable(_) | Self::Store(_)
        )
    }
}
