//! Error types for the mesh compatibility layer.
//!
//! Delegate backends return [`CompatError`] directly, so failures coming out
//! of the wrapped backend pass through the facade unchanged.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result type alias for compatibility layer operations.
pub type Result<T> = std::result::Result<T, CompatError>;

/// Errors that can occur while reconciling the registry with the mesh.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompatError {
    /// The external node cache never completed its first full sync.
    #[error("node cache not synced: {reason}")]
    CacheNotSynced {
        /// Why the sync did not complete.
        reason: String,
    },

    /// A node is absent from one of the two sources.
    #[error("node {name} not found")]
    NodeNotFound {
        /// The node name that was looked up.
        name: String,
    },

    /// The delegate mesh backend failed.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// A kernel address-set operation failed.
    #[error("address set error: {operation} failed: {reason}")]
    AddressSet {
        /// The operation that failed.
        operation: String,
        /// Reason for the failure.
        reason: String,
    },

    /// The external registry watch ended while the cache was still in use.
    #[error("node registry watch closed unexpectedly")]
    RegistryClosed,

    /// A once-per-lifecycle component was started a second time.
    #[error("{component} already initialized")]
    AlreadyInitialized {
        /// The component that was initialized twice.
        component: String,
    },

    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Configuration file could not be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying IO error message.
        message: String,
    },
}

impl CompatError {
    /// Creates a `CacheNotSynced` error.
    #[must_use]
    pub fn cache_not_synced(reason: impl Into<String>) -> Self {
        Self::CacheNotSynced {
            reason: reason.into(),
        }
    }

    /// Creates a `NodeNotFound` error.
    #[must_use]
    pub fn node_not_found(name: impl Into<String>) -> Self {
        Self::NodeNotFound { name: name.into() }
    }

    /// Creates a `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates an `AddressSet` error.
    #[must_use]
    pub fn address_set(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AddressSet {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `AlreadyInitialized` error.
    #[must_use]
    pub fn already_initialized(component: impl Into<String>) -> Self {
        Self::AlreadyInitialized {
            component: component.into(),
        }
    }

    /// Creates a `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this error means a node is missing from a source.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NodeNotFound { .. })
    }

    /// Returns true if this error aborted startup.
    #[must_use]
    pub fn is_startup_failure(&self) -> bool {
        matches!(self, Self::CacheNotSynced { .. })
    }
}

/// Shared sender for asynchronous failures.
///
/// Clones share one slot. Once the slot is closed, later [`sender`](Self::sender)
/// calls return `None`, and the channel ends when the last handed-out sender
/// is dropped.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    slot: Arc<Mutex<Option<mpsc::Sender<CompatError>>>>,
}

impl ErrorSink {
    /// Creates a sink feeding `tx`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<CompatError>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Returns a sender, or `None` once the sink is closed.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<CompatError>> {
        self.slot.lock().clone()
    }

    /// Drops the sink's own sender.
    pub fn close(&self) {
        self.slot.lock().take();
    }

    /// Closes the sink once `cancel` fires.
    pub fn close_on(&self, cancel: CancellationToken) {
        let sink = self.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            sink.close();
            debug!("error channel closed");
        });
    }
}
