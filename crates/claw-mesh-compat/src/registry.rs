//! Local cache of the external node registry.
//!
//! The registry is consumed as a list-then-watch stream of
//! [`RegistryEvent`]s. A relist (`Init`, `InitApply`*, `InitDone`) is buffered
//! and swapped in atomically, so readers only ever see complete snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CompatError, Result};
use crate::types::ExternalNode;

/// A change reported by the external registry watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A full relist is starting.
    Init,
    /// A node that is part of the relist.
    InitApply(ExternalNode),
    /// The relist is complete.
    InitDone,
    /// A node was created or modified.
    Apply(ExternalNode),
    /// A node was removed.
    Delete(ExternalNode),
}

/// Client for the external node registry.
pub trait NodeRegistry {
    /// Opens a watch over all registry nodes, starting with a full relist.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch cannot be established.
    fn watch(&self) -> Result<mpsc::Receiver<RegistryEvent>>;
}

impl<T: NodeRegistry + ?Sized> NodeRegistry for Arc<T> {
    fn watch(&self) -> Result<mpsc::Receiver<RegistryEvent>> {
        (**self).watch()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Pending,
    Synced,
    Closed,
}

#[derive(Debug, Default)]
struct CacheState {
    nodes: HashMap<String, ExternalNode>,
    relist: Option<HashMap<String, ExternalNode>>,
}

/// Continuously updated cache of registry nodes.
#[derive(Debug)]
pub struct NodeCache {
    state: RwLock<CacheState>,
    sync: watch::Sender<SyncState>,
    started: AtomicBool,
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCache {
    /// Creates an empty, unsynced cache.
    #[must_use]
    pub fn new() -> Self {
        let (sync, _) = watch::channel(SyncState::Pending);
        Self {
            state: RwLock::new(CacheState::default()),
            sync,
            started: AtomicBool::new(false),
        }
    }

    /// Starts watching `registry` and waits for the first full sync.
    ///
    /// The watch task runs until `cancel` fires. Once synced, a watch stream
    /// that ends early is reported on `errors`.
    ///
    /// # Errors
    ///
    /// Returns [`CompatError::CacheNotSynced`] if cancellation, the timeout,
    /// or the end of the watch stream comes first. The watch task has exited
    /// by the time the error is returned.
    pub async fn init<R: NodeRegistry + ?Sized>(
        self: &Arc<Self>,
        registry: &R,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        errors: Option<mpsc::Sender<CompatError>>,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CompatError::already_initialized("node cache"));
        }

        let events = registry.watch()?;
        let token = cancel.child_token();
        let task = tokio::spawn(run_watch(
            Arc::clone(self),
            events,
            token.clone(),
            errors,
        ));

        let mut sync = self.sync.subscribe();
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(CompatError::cache_not_synced(
                "cancelled before initial sync",
            )),
            () = deadline => Err(CompatError::cache_not_synced(format!(
                "initial sync did not complete within {:?}",
                timeout.unwrap_or_default()
            ))),
            state = sync.wait_for(|s| *s != SyncState::Pending) => match state.map(|s| *s) {
                Ok(SyncState::Synced) => Ok(()),
                _ => Err(CompatError::cache_not_synced(
                    "registry watch closed before initial sync",
                )),
            },
        };

        match outcome {
            Ok(()) => {
                info!(nodes = self.len(), "node cache synced");
                Ok(())
            }
            Err(e) => {
                token.cancel();
                if let Err(join) = task.await {
                    warn!(error = %join, "node cache watch task failed");
                }
                error!(error = %e, "node cache failed to sync");
                Err(e)
            }
        }
    }

    /// Returns true once the first full relist has completed.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.sync.borrow() == SyncState::Synced
    }

    /// Returns the cached record for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CompatError::NodeNotFound`] if the registry has no such node.
    pub fn get(&self, name: &str) -> Result<ExternalNode> {
        self.state
            .read()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| CompatError::node_not_found(name))
    }

    /// Returns every cached record, in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<ExternalNode> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Returns the number of cached records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Returns true if the cache holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies one registry event to the cache.
    pub fn apply(&self, event: RegistryEvent) {
        let mut state = self.state.write();
        match event {
            RegistryEvent::Init => {
                debug!("node registry relist started");
                state.relist = Some(HashMap::new());
            }
            RegistryEvent::InitApply(node) => {
                state
                    .relist
                    .get_or_insert_with(HashMap::new)
                    .insert(node.name.clone(), node);
            }
            RegistryEvent::InitDone => {
                if let Some(nodes) = state.relist.take() {
                    state.nodes = nodes;
                }
                debug!(nodes = state.nodes.len(), "node registry relist done");
                drop(state);
                self.sync.send_replace(SyncState::Synced);
            }
            RegistryEvent::Apply(node) => {
                debug!(node = %node.name, "registry node applied");
                state.nodes.insert(node.name.clone(), node);
            }
            RegistryEvent::Delete(node) => {
                debug!(node = %node.name, "registry node deleted");
                state.nodes.remove(&node.name);
            }
        }
    }

    fn mark_closed(&self) {
        self.sync.send_if_modified(|state| {
            if *state == SyncState::Pending {
                *state = SyncState::Closed;
                true
            } else {
                false
            }
        });
    }
}

async fn run_watch(
    cache: Arc<NodeCache>,
    mut events: mpsc::Receiver<RegistryEvent>,
    cancel: CancellationToken,
    errors: Option<mpsc::Sender<CompatError>>,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("node cache watch stopped");
                return;
            }
            event = events.recv() => match event {
                Some(event) => cache.apply(event),
                None => break,
            },
        }
    }

    if !cache.has_synced() {
        cache.mark_closed();
        return;
    }

    error!("node registry watch closed; serving last known nodes");
    if let Some(errors) = errors {
        tokio::select! {
            () = cancel.cancelled() => {}
            _ = errors.send(CompatError::RegistryClosed) => {}
        }
    }
}
