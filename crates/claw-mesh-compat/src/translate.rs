//! Merging of registry records with mesh records.

use tracing::trace;

use crate::registry::NodeCache;
use crate::types::{ExternalNode, Node, NodeEvent};

/// Merges a registry record with the mesh's own record for the same node.
///
/// Mesh-specific fields come from `internal`. The private IP comes from the
/// registry hint under `private_ip_key`, falling back to the mesh record when
/// the hint is missing or malformed. Without an internal record the result
/// carries only what the registry knows.
#[must_use]
pub fn translate(external: &ExternalNode, internal: Option<&Node>, private_ip_key: &str) -> Node {
    let hint = external.private_ip(private_ip_key);
    match internal {
        Some(internal) => Node {
            name: external.name.clone(),
            private_ip: hint.or(internal.private_ip),
            ..internal.clone()
        },
        None => Node {
            name: external.name.clone(),
            private_ip: hint,
            ..Node::default()
        },
    }
}

/// Translates a mesh event against the registry cache.
///
/// The registry record is looked up by the name carried in `event` itself.
/// When the registry has no record the mesh node is passed through as is.
#[must_use]
pub fn translate_event(cache: &NodeCache, event: NodeEvent, private_ip_key: &str) -> NodeEvent {
    let NodeEvent { kind, node } = event;
    match cache.get(&node.name) {
        Ok(external) => NodeEvent::new(kind, translate(&external, Some(&node), private_ip_key)),
        Err(e) => {
            trace!(node = %node.name, error = %e, "no registry record, forwarding mesh node");
            NodeEvent::new(kind, node)
        }
    }
}
