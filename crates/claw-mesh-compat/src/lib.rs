//! Network-policy registry compatibility for the Clawbernetes mesh.
//!
//! When a separate network-policy system owns the cluster's node registry,
//! the mesh has to reconcile that registry with its own node model. This
//! crate provides:
//!
//! - [`CompatBackend`], a mesh backend that merges registry nodes into the
//!   mesh's own nodes and relays translated node events
//! - [`PeerSetSync`], which keeps a kernel address set equal to the private
//!   IPs of the local location so encapsulation-exemption rules stay correct
//! - [`Compat`], which ties both to one cancellation token and one error
//!   channel
//!
//! # Example
//!
//! ```rust,no_run
//! use claw_mesh_compat::fake::{FakeAddressSet, FakeBackend, FakeRegistry};
//! use claw_mesh_compat::{Compat, CompatConfig, Encapsulation, MeshBackend, Topology};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> claw_mesh_compat::Result<()> {
//! let compat = Compat::new(
//!     CompatConfig::default(),
//!     FakeRegistry::with_nodes(vec![]),
//!     FakeAddressSet::new("claw-mesh-peers"),
//! )?;
//! let cancel = CancellationToken::new();
//!
//! let mut errors = compat.run(&cancel)?;
//! let backend = compat.backend(FakeBackend::with_nodes(vec![]))?;
//! backend.init(&cancel).await?;
//!
//! compat.apply(&Topology::default(), Encapsulation::Always, "us-west")?;
//! # let _ = errors.try_recv();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod fake;
pub mod peerset;
pub mod registry;
pub mod relay;
pub mod translate;
pub mod types;

pub use backend::{CompatBackend, MeshBackend};
pub use config::CompatConfig;
pub use controller::Compat;
pub use error::{CompatError, ErrorSink, Result};
pub use peerset::{AddressSet, PeerSetSync};
pub use registry::{NodeCache, NodeRegistry, RegistryEvent};
pub use relay::EventRelay;
pub use translate::{translate, translate_event};
pub use types::{
    Encapsulation, EventKind, ExternalNode, Node, NodeEvent, NodeEventStream, Segment, Topology,
};
