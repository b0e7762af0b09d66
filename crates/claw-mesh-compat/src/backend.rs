//! Node backend facade over the mesh's own backend.
//!
//! [`CompatBackend`] wraps a delegate [`MeshBackend`] and answers node reads
//! from the union of the external registry cache and the delegate. Writes,
//! cleanup and peer handling go straight to the delegate; the registry is
//! never written.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CompatConfig;
use crate::error::{CompatError, ErrorSink, Result};
use crate::registry::{NodeCache, NodeRegistry};
use crate::relay::EventRelay;
use crate::translate::translate;
use crate::types::{Node, NodeEvent, NodeEventStream};

/// The node half of a mesh backend, plus its peer sub-backend.
#[allow(async_fn_in_trait)]
pub trait MeshBackend {
    /// Peer sub-backend, passed through untouched by wrappers.
    type Peers;

    /// Starts the backend. Background work stops when `cancel` fires.
    async fn init(&self, cancel: &CancellationToken) -> Result<()>;

    /// Gets a node by name.
    async fn get(&self, name: &str) -> Result<Node>;

    /// Lists all nodes.
    async fn list(&self) -> Result<Vec<Node>>;

    /// Writes a node.
    async fn set(&self, name: &str, node: &Node) -> Result<()>;

    /// Removes any state held for a node.
    async fn clean_up(&self, name: &str) -> Result<()>;

    /// Returns the node event stream. Repeated calls return the same stream.
    fn watch(&self) -> NodeEventStream;

    /// Returns the peer sub-backend.
    fn peers(&self) -> &Self::Peers;
}

/// Mesh backend that merges registry nodes into the delegate's nodes.
pub struct CompatBackend<B, R> {
    delegate: B,
    registry: R,
    cache: Arc<NodeCache>,
    config: CompatConfig,
    outbound: NodeEventStream,
    relay_tx: Mutex<Option<mpsc::Sender<NodeEvent>>>,
    errors: ErrorSink,
}

impl<B, R> CompatBackend<B, R>
where
    B: MeshBackend,
    R: NodeRegistry,
{
    /// Wraps `delegate`, reading external nodes from `registry`.
    ///
    /// Asynchronous failures after startup are sent to `errors` while it is
    /// open; pass [`ErrorSink::default`] to discard them.
    #[must_use]
    pub fn new(delegate: B, registry: R, config: CompatConfig, errors: ErrorSink) -> Self {
        let (relay_tx, outbound) = NodeEventStream::channel(config.event_buffer);
        Self {
            delegate,
            registry,
            cache: Arc::new(NodeCache::new()),
            config,
            outbound,
            relay_tx: Mutex::new(Some(relay_tx)),
            errors,
        }
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn delegate(&self) -> &B {
        &self.delegate
    }

    /// Returns the registry cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    fn key(&self) -> &str {
        &self.config.private_ip_key
    }
}

impl<B, R> MeshBackend for CompatBackend<B, R>
where
    B: MeshBackend,
    R: NodeRegistry,
{
    type Peers = B::Peers;

    async fn init(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(relay_tx) = self.relay_tx.lock().take() else {
            return Err(CompatError::already_initialized("node backend"));
        };

        self.delegate.init(cancel).await?;
        self.cache
            .init(
                &self.registry,
                cancel,
                self.config.cache_sync_timeout(),
                self.errors.sender(),
            )
            .await?;

        EventRelay::new(
            Arc::clone(&self.cache),
            self.delegate.watch(),
            relay_tx,
            self.key(),
        )
        .spawn(cancel.child_token());

        info!(nodes = self.cache.len(), "compat node backend initialized");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Node> {
        let external = self.cache.get(name)?;
        let internal = self.delegate.get(name).await?;
        Ok(translate(&external, Some(&internal), self.key()))
    }

    async fn list(&self) -> Result<Vec<Node>> {
        let roster = self.cache.list();
        let mut nodes = Vec::with_capacity(roster.len());

        for external in &roster {
            match self.delegate.get(&external.name).await {
                Ok(internal) => nodes.push(translate(external, Some(&internal), self.key())),
                Err(e) if e.is_not_found() && !self.config.strict_list => {
                    debug!(node = %external.name, "node unknown to mesh, using registry data");
                    nodes.push(translate(external, None, self.key()));
                }
                Err(e) => {
                    warn!(node = %external.name, error = %e, "failed to list mesh node");
                    return Err(e);
                }
            }
        }

        Ok(nodes)
    }

    async fn set(&self, name: &str, node: &Node) -> Result<()> {
        self.delegate.set(name, node).await
    }

    async fn clean_up(&self, name: &str) -> Result<()> {
        self.delegate.clean_up(name).await
    }

    fn watch(&self) -> NodeEventStream {
        self.outbound.clone()
    }

    fn peers(&self) -> &Self::Peers {
        self.delegate.peers()
    }
}

impl<B, R> fmt::Debug for CompatBackend<B, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatBackend")
            .field("cached_nodes", &self.cache.len())
            .field("synced", &self.cache.has_synced())
            .field("initialized", &self.relay_tx.lock().is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeBackend, FakeRegistry};
    use crate::registry::RegistryEvent;
    use crate::types::{EventKind, ExternalNode};

    const KEY: &str = crate::config::DEFAULT_PRIVATE_IP_KEY;

    fn mesh_node(name: &str, subnet: &str) -> Node {
        Node {
            name: name.into(),
            location: "us-west".into(),
            subnet: Some(subnet.parse().expect("net")),
            endpoint: Some("192.0.2.1:51820".parse().expect("addr")),
            public_key: Some(format!("{name}-key")),
            ..Node::default()
        }
    }

    fn external(name: &str, ip: &str) -> ExternalNode {
        ExternalNode::new(name).with_metadata(KEY, ip)
    }

    async fn started(
        delegate: FakeBackend,
        registry: FakeRegistry,
        config: CompatConfig,
    ) -> (CompatBackend<FakeBackend, FakeRegistry>, CancellationToken) {
        let backend = CompatBackend::new(delegate, registry, config, ErrorSink::default());
        let cancel = CancellationToken::new();
        backend.init(&cancel).await.expect("init");
        (backend, cancel)
    }

    // ==================== READ TESTS ====================

    #[tokio::test]
    async fn test_get_merges_both_sources() {
        let delegate = FakeBackend::with_nodes(vec![mesh_node("a", "10.244.1.0/24")]);
        let registry = FakeRegistry::with_nodes(vec![external("a", "10.0.0.1")]);
        let (backend, cancel) = started(delegate, registry, CompatConfig::default()).await;

        let node = backend.get("a").await.expect("get");
        assert_eq!(node.subnet, Some("10.244.1.0/24".parse().expect("net")));
        assert_eq!(node.public_key.as_deref(), Some("a-key"));
        assert_eq!(node.private_ip, Some("10.0.0.1/32".parse().expect("net")));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_get_missing_from_registry() {
        let delegate = FakeBackend::with_nodes(vec![mesh_node("a", "10.244.1.0/24")]);
        let (backend, cancel) =
            started(delegate, FakeRegistry::with_nodes(vec![]), CompatConfig::default()).await;

        let result = backend.get("a").await;
        assert_eq!(result, Err(CompatError::node_not_found("a")));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_get_propagates_delegate_failure() {
        let delegate = FakeBackend::with_nodes(vec![]);
        delegate.fail_gets(CompatError::backend("mesh store unavailable"));
        let registry = FakeRegistry::with_nodes(vec![external("a", "10.0.0.1")]);
        let (backend, cancel) = started(delegate, registry, CompatConfig::default()).await;

        let result = backend.get("a").await;
        assert_eq!(result, Err(CompatError::backend("mesh store unavailable")));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_list_uses_registry_roster() {
        let delegate = FakeBackend::with_nodes(vec![
            mesh_node("a", "10.244.1.0/24"),
            mesh_node("b", "10.244.2.0/24"),
            mesh_node("mesh-only", "10.244.3.0/24"),
        ]);
        let registry =
            FakeRegistry::with_nodes(vec![external("a", "10.0.0.1"), external("b", "10.0.0.2")]);
        let (backend, cancel) = started(delegate, registry, CompatConfig::default()).await;

        let mut nodes = backend.list().await.expect("list");
        nodes.sort_by(|x, y| x.name.cmp(&y.name));

        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(nodes[1].private_ip, Some("10.0.0.2/32".parse().expect("net")));
        assert_eq!(nodes[1].subnet, Some("10.244.2.0/24".parse().expect("net")));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_list_fails_on_membership_mismatch() {
        let delegate = FakeBackend::with_nodes(vec![mesh_node("a", "10.244.1.0/24")]);
        let registry =
            FakeRegistry::with_nodes(vec![external("a", "10.0.0.1"), external("ghost", "10.0.0.9")]);
        let (backend, cancel) = started(delegate, registry, CompatConfig::default()).await;

        let result = backend.list().await;
        assert_eq!(result, Err(CompatError::node_not_found("ghost")));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_lenient_list_falls_back_to_registry() {
        let delegate = FakeBackend::with_nodes(vec![mesh_node("a", "10.244.1.0/24")]);
        let registry =
            FakeRegistry::with_nodes(vec![external("a", "10.0.0.1"), external("ghost", "10.0.0.9")]);
        let config = CompatConfig {
            strict_list: false,
            ..CompatConfig::default()
        };
        let (backend, cancel) = started(delegate, registry, config).await;

        let nodes = backend.list().await.expect("list");
        let ghost = nodes.iter().find(|n| n.name == "ghost").expect("ghost listed");
        assert!(ghost.subnet.is_none());
        assert_eq!(ghost.private_ip, Some("10.0.0.9/32".parse().expect("net")));
        cancel.cancel();
    }

    // ==================== WRITE TESTS ====================

    #[tokio::test]
    async fn test_set_and_clean_up_pass_through() {
        let delegate = FakeBackend::with_nodes(vec![]);
        let registry = FakeRegistry::with_nodes(vec![external("a", "10.0.0.1")]);
        let (backend, cancel) = started(delegate, registry, CompatConfig::default()).await;

        let node = mesh_node("a", "10.244.1.0/24");
        backend.set("a", &node).await.expect("set");
        assert_eq!(backend.delegate().node("a"), Some(node));

        backend.clean_up("a").await.expect("clean up");
        assert_eq!(backend.delegate().cleaned_up(), vec!["a".to_string()]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_peers_pass_through() {
        let backend = CompatBackend::new(
            FakeBackend::with_nodes(vec![]),
            FakeRegistry::with_nodes(vec![]),
            CompatConfig::default(),
            ErrorSink::default(),
        );
        assert!(std::ptr::eq(backend.peers(), backend.delegate().peers()));
    }

    // ==================== INIT TESTS ====================

    #[tokio::test]
    async fn test_init_delegate_failure_skips_cache_sync() {
        let delegate = FakeBackend::with_nodes(vec![]);
        delegate.fail_init(CompatError::backend("no mesh"));
        let registry = FakeRegistry::with_nodes(vec![external("a", "10.0.0.1")]);
        let backend = CompatBackend::new(
            delegate,
            registry,
            CompatConfig::default(),
            ErrorSink::default(),
        );

        let result = backend.init(&CancellationToken::new()).await;

        assert_eq!(result, Err(CompatError::backend("no mesh")));
        assert_eq!(backend.registry.watch_count(), 0);
        assert!(!backend.cache().has_synced());
        // The relay was never started, so the outbound stream is closed.
        assert!(backend.watch().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_init_fails_when_cache_never_syncs() {
        let config = CompatConfig {
            cache_sync_timeout_secs: Some(1),
            ..CompatConfig::default()
        };
        let backend = CompatBackend::new(
            FakeBackend::with_nodes(vec![]),
            FakeRegistry::unsynced(),
            config,
            ErrorSink::default(),
        );

        let result = backend.init(&CancellationToken::new()).await;
        assert!(result.expect_err("should fail").is_startup_failure());
        assert!(backend.watch().recv().await.is_none());
    }

    #[tokio::test]
    async fn test_init_twice_rejected() {
        let (backend, cancel) = started(
            FakeBackend::with_nodes(vec![]),
            FakeRegistry::with_nodes(vec![]),
            CompatConfig::default(),
        )
        .await;

        let result = backend.init(&cancel).await;
        assert!(matches!(result, Err(CompatError::AlreadyInitialized { .. })));
        assert_eq!(backend.delegate().init_count(), 1);
        cancel.cancel();
    }

    // ==================== WATCH TESTS ====================

    #[tokio::test]
    async fn test_watch_returns_same_stream() {
        let backend = CompatBackend::new(
            FakeBackend::with_nodes(vec![]),
            FakeRegistry::with_nodes(vec![]),
            CompatConfig::default(),
            ErrorSink::default(),
        );
        assert!(backend.watch().same_channel(&backend.watch()));
    }

    #[tokio::test]
    async fn test_watch_translates_with_latest_registry_record() {
        let delegate = FakeBackend::with_nodes(vec![]);
        let registry = FakeRegistry::with_nodes(vec![external("a", "10.0.0.1")]);
        let (backend, cancel) = started(delegate, registry.clone(), CompatConfig::default()).await;
        let events = backend.watch();

        backend
            .delegate()
            .emit(NodeEvent::new(EventKind::Add, mesh_node("a", "10.244.1.0/24")))
            .await;
        let first = events.recv().await.expect("event");
        assert_eq!(first.node.private_ip, Some("10.0.0.1/32".parse().expect("net")));

        registry.publish(RegistryEvent::Apply(external("a", "10.0.0.7"))).await;
        for _ in 0..100 {
            if backend.cache().get("a").ok().and_then(|n| n.private_ip(KEY))
                == Some("10.0.0.7/32".parse().expect("net"))
            {
                break;
            }
            tokio::task::yield_now().await;
        }

        backend
            .delegate()
            .emit(NodeEvent::new(EventKind::Update, mesh_node("a", "10.244.1.0/24")))
            .await;
        let second = events.recv().await.expect("event");
        assert_eq!(second.kind, EventKind::Update);
        assert_eq!(second.node.private_ip, Some("10.0.0.7/32".parse().expect("net")));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watch_closes_on_cancel() {
        let (backend, cancel) = started(
            FakeBackend::with_nodes(vec![]),
            FakeRegistry::with_nodes(vec![]),
            CompatConfig::default(),
        )
        .await;

        cancel.cancel();
        assert!(backend.watch().recv().await.is_none());
    }
}
