//! Core types shared by the registry cache, the backend facade and the
//! peer address set.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::CompatError;

// ─────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────

/// A node as seen by the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node name, shared by both sources.
    pub name: String,
    /// Logical location (segment id) of the node.
    pub location: String,
    /// Public WireGuard endpoint.
    pub endpoint: Option<SocketAddr>,
    /// Pod subnet routed to this node.
    pub subnet: Option<IpNet>,
    /// Private IP of the node inside its location.
    pub private_ip: Option<IpNet>,
    /// Base64-encoded WireGuard public key.
    pub public_key: Option<String>,
    /// When the node last reported in.
    pub last_seen: Option<DateTime<Utc>>,
    /// Whether the node asked to lead its location.
    pub leader: bool,
    /// Persistent keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
}

impl Node {
    /// Creates an otherwise empty node with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A node record owned by the external network-policy registry.
///
/// Only the name and metadata are consumed; the registry is never written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNode {
    /// Node name.
    pub name: String,
    /// Free-form metadata published by the registry.
    pub metadata: BTreeMap<String, String>,
}

impl ExternalNode {
    /// Creates a registry record with no metadata.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Parses the private IP hint stored under `key`.
    ///
    /// Accepts `addr/prefix` or a bare address, which gets a host prefix.
    /// Missing or malformed hints yield `None`.
    #[must_use]
    pub fn private_ip(&self, key: &str) -> Option<IpNet> {
        let raw = self.metadata.get(key)?.trim();
        if let Ok(net) = raw.parse::<IpNet>() {
            return Some(net);
        }
        let addr = raw.parse::<IpAddr>().ok()?;
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        IpNet::new(addr, prefix).ok()
    }
}

// ─────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────

/// Kind of change carried by a [`NodeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A node appeared.
    Add,
    /// A node changed.
    Update,
    /// A node went away.
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A change to a mesh node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    /// What happened.
    pub kind: EventKind,
    /// The node it happened to.
    pub node: Node,
}

impl NodeEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(kind: EventKind, node: Node) -> Self {
        Self { kind, node }
    }
}

/// Single-consumer stream of node events.
///
/// Clones share the same underlying receiver, so handing the stream out
/// repeatedly always yields the same channel.
#[derive(Debug, Clone)]
pub struct NodeEventStream {
    inner: Arc<Mutex<mpsc::Receiver<NodeEvent>>>,
}

impl NodeEventStream {
    /// Wraps an existing receiver.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<NodeEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rx)),
        }
    }

    /// Creates a bounded channel and returns its sender with the stream.
    #[must_use]
    pub fn channel(buffer: usize) -> (mpsc::Sender<NodeEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }

    /// Receives the next event, or `None` once every sender is gone.
    pub async fn recv(&self) -> Option<NodeEvent> {
        self.inner.lock().await.recv().await
    }

    /// Returns true if both handles refer to the same channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ─────────────────────────────────────────────────────────────
// Topology
// ─────────────────────────────────────────────────────────────

/// Nodes sharing one logical location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Location shared by the segment's nodes.
    pub location: String,
    /// Private IPs of the segment's nodes.
    pub private_ips: Vec<IpAddr>,
}

impl Segment {
    /// Creates a segment.
    #[must_use]
    pub fn new(location: impl Into<String>, private_ips: Vec<IpAddr>) -> Self {
        Self {
            location: location.into(),
            private_ips,
        }
    }
}

/// Snapshot of the mesh topology as computed by the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Segments in topology order.
    pub segments: Vec<Segment>,
}

impl Topology {
    /// Creates a topology from its segments.
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Returns the first segment at `location`.
    #[must_use]
    pub fn segment(&self, location: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.location == location)
    }
}

/// Whether cross-location traffic is encapsulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encapsulation {
    /// Always encapsulate.
    Always,
    /// Encapsulate only when crossing subnets.
    CrossSubnet,
    /// Never encapsulate.
    Never,
}

impl fmt::Display for Encapsulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::CrossSubnet => write!(f, "crosssubnet"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl FromStr for Encapsulation {
    type Err = CompatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "crosssubnet" => Ok(Self::CrossSubnet),
            "never" => Ok(Self::Never),
            other => Err(CompatError::config(format!(
                "unknown encapsulation mode '{other}'"
            ))),
        }
    }
}
