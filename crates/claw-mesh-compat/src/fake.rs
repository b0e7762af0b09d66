//! In-memory collaborators for tests and local development.
//!
//! [`FakeRegistry`], [`FakeBackend`] and [`FakeAddressSet`] stand in for the
//! external node registry, the mesh's own backend and the kernel address set.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::MeshBackend;
use crate::error::{CompatError, Result};
use crate::peerset::AddressSet;
use crate::registry::{NodeRegistry, RegistryEvent};
use crate::types::{ExternalNode, Node, NodeEvent, NodeEventStream};

/// Headroom on top of the initial relist in fake channels.
const FAKE_CHANNEL_SLACK: usize = 64;

// ─────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RegistryState {
    initial: Vec<ExternalNode>,
    synced: bool,
    closed: bool,
    failure: Option<CompatError>,
    sender: Option<mpsc::Sender<RegistryEvent>>,
    watches: usize,
}

/// A fake node registry. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl FakeRegistry {
    /// A registry whose watch relists `nodes` and reports the sync.
    #[must_use]
    pub fn with_nodes(nodes: Vec<ExternalNode>) -> Self {
        let registry = Self::default();
        {
            let mut state = registry.state.lock();
            state.initial = nodes;
            state.synced = true;
        }
        registry
    }

    /// A registry whose watch starts a relist but never finishes it.
    #[must_use]
    pub fn unsynced() -> Self {
        Self::default()
    }

    /// A registry whose watch cannot be opened.
    #[must_use]
    pub fn failing(error: CompatError) -> Self {
        let registry = Self::default();
        registry.state.lock().failure = Some(error);
        registry
    }

    /// Sends an event on the open watch, if any.
    pub async fn publish(&self, event: RegistryEvent) {
        let sender = self.state.lock().sender.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Ends the open watch and makes later watches end immediately.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.sender = None;
    }

    /// Number of times a watch was requested.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches
    }
}

impl NodeRegistry for FakeRegistry {
    fn watch(&self) -> Result<mpsc::Receiver<RegistryEvent>> {
        let mut state = self.state.lock();
        state.watches += 1;
        if let Some(e) = &state.failure {
            return Err(e.clone());
        }

        let (tx, rx) = mpsc::channel(state.initial.len() + FAKE_CHANNEL_SLACK);
        if state.closed {
            return Ok(rx);
        }

        let mut relist = vec![RegistryEvent::Init];
        relist.extend(state.initial.iter().cloned().map(RegistryEvent::InitApply));
        if state.synced {
            relist.push(RegistryEvent::InitDone);
        }
        for event in relist {
            tx.try_send(event)
                .map_err(|e| CompatError::backend(format!("fake registry overflow: {e}")))?;
        }

        state.sender = Some(tx);
        Ok(rx)
    }
}

// ─────────────────────────────────────────────────────────────
// Mesh backend
// ─────────────────────────────────────────────────────────────

/// Peer sub-backend of [`FakeBackend`].
#[derive(Debug, Default)]
pub struct FakePeers {
    names: Mutex<Vec<String>>,
}

impl FakePeers {
    /// Registers a peer name.
    pub fn add(&self, name: impl Into<String>) {
        self.names.lock().push(name.into());
    }

    /// Returns the registered peer names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.names.lock().clone()
    }
}

/// A fake mesh backend holding nodes in memory.
#[derive(Debug)]
pub struct FakeBackend {
    nodes: Mutex<HashMap<String, Node>>,
    cleaned_up: Mutex<Vec<String>>,
    init_failure: Mutex<Option<CompatError>>,
    get_failure: Mutex<Option<CompatError>>,
    inits: AtomicUsize,
    events_tx: mpsc::Sender<NodeEvent>,
    events: NodeEventStream,
    peers: FakePeers,
}

impl FakeBackend {
    /// Creates a backend holding `nodes`.
    #[must_use]
    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        let (events_tx, events) = NodeEventStream::channel(FAKE_CHANNEL_SLACK);
        Self {
            nodes: Mutex::new(nodes.into_iter().map(|n| (n.name.clone(), n)).collect()),
            cleaned_up: Mutex::new(Vec::new()),
            init_failure: Mutex::new(None),
            get_failure: Mutex::new(None),
            inits: AtomicUsize::new(0),
            events_tx,
            events,
            peers: FakePeers::default(),
        }
    }

    /// Makes `init` fail with `error`.
    pub fn fail_init(&self, error: CompatError) {
        *self.init_failure.lock() = Some(error);
    }

    /// Makes every `get` fail with `error`.
    pub fn fail_gets(&self, error: CompatError) {
        *self.get_failure.lock() = Some(error);
    }

    /// Emits a node event on the watch stream.
    pub async fn emit(&self, event: NodeEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Returns the stored node, if any.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().get(name).cloned()
    }

    /// Names passed to `clean_up`, in call order.
    #[must_use]
    pub fn cleaned_up(&self) -> Vec<String> {
        self.cleaned_up.lock().clone()
    }

    /// Number of `init` calls.
    #[must_use]
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }
}

impl MeshBackend for FakeBackend {
    type Peers = FakePeers;

    async fn init(&self, _cancel: &CancellationToken) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        match self.init_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn get(&self, name: &str) -> Result<Node> {
        if let Some(e) = self.get_failure.lock().clone() {
            return Err(e);
        }
        self.node(name)
            .ok_or_else(|| CompatError::node_not_found(name))
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().values().cloned().collect())
    }

    async fn set(&self, name: &str, node: &Node) -> Result<()> {
        self.nodes.lock().insert(name.to_string(), node.clone());
        Ok(())
    }

    async fn clean_up(&self, name: &str) -> Result<()> {
        self.cleaned_up.lock().push(name.to_string());
        Ok(())
    }

    fn watch(&self) -> NodeEventStream {
        self.events.clone()
    }

    fn peers(&self) -> &Self::Peers {
        &self.peers
    }
}

// ─────────────────────────────────────────────────────────────
// Address set
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SetState {
    contents: Option<Vec<IpAddr>>,
    set_count: usize,
    next_failure: Option<CompatError>,
    reporter: Option<mpsc::Sender<CompatError>>,
    runs: usize,
}

/// A fake address set. `None` contents means the set does not exist.
#[derive(Debug)]
pub struct FakeAddressSet {
    name: String,
    state: Mutex<SetState>,
}

impl FakeAddressSet {
    /// Creates a fake set that does not exist yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SetState::default()),
        }
    }

    /// Current contents, or `None` if the set does not exist.
    #[must_use]
    pub fn contents(&self) -> Option<Vec<IpAddr>> {
        self.state.lock().contents.clone()
    }

    /// Number of successful `set` calls.
    #[must_use]
    pub fn set_count(&self) -> usize {
        self.state.lock().set_count
    }

    /// Number of `run` calls.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.state.lock().runs
    }

    /// Makes the next `set` fail with `error`.
    pub fn fail_next_set(&self, error: CompatError) {
        self.state.lock().next_failure = Some(error);
    }

    /// Reports an asynchronous failure through the running supervisor.
    pub async fn report(&self, error: CompatError) {
        let reporter = self.state.lock().reporter.clone();
        if let Some(reporter) = reporter {
            let _ = reporter.send(error).await;
        }
    }
}

impl AddressSet for FakeAddressSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, cancel: &CancellationToken) -> Result<mpsc::Receiver<CompatError>> {
        let (errors_tx, errors_rx) = mpsc::channel(FAKE_CHANNEL_SLACK);
        let (report_tx, mut report_rx) = mpsc::channel::<CompatError>(FAKE_CHANNEL_SLACK);
        {
            let mut state = self.state.lock();
            state.runs += 1;
            state.reporter = Some(report_tx);
        }

        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    reported = report_rx.recv() => match reported {
                        Some(e) => {
                            if errors_tx.send(e).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(errors_rx)
    }

    fn clean_up(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.contents = None;
        state.reporter = None;
        Ok(())
    }

    fn set(&self, addrs: &[IpAddr]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(e) = state.next_failure.take() {
            return Err(e);
        }
        state.contents = Some(addrs.to_vec());
        state.set_count += 1;
        Ok(())
    }
}
