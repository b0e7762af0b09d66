//! Lifecycle of the compatibility layer.
//!
//! [`Compat`] owns the registry client and the peer address set, builds the
//! single backend facade, and funnels every asynchronous failure into one
//! error channel.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CompatBackend, MeshBackend};
use crate::config::CompatConfig;
use crate::error::{CompatError, ErrorSink, Result};
use crate::peerset::{AddressSet, PeerSetSync};
use crate::registry::NodeRegistry;
use crate::types::{Encapsulation, Topology};

/// Capacity of the aggregated error channel.
const ERROR_BUFFER: usize = 16;

/// Entry point wiring the registry, the backend facade and the peer set.
pub struct Compat<R, S> {
    config: CompatConfig,
    registry: Arc<R>,
    peers: PeerSetSync<S>,
    errors: ErrorSink,
    errors_rx: Mutex<Option<mpsc::Receiver<CompatError>>>,
    backend_built: AtomicBool,
}

impl<R, S> Compat<R, S>
where
    R: NodeRegistry,
    S: AddressSet,
{
    /// Creates the controller.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or names a different address
    /// set than `address_set`.
    pub fn new(config: CompatConfig, registry: R, address_set: S) -> Result<Self> {
        config.validate()?;
        if address_set.name() != config.address_set_name {
            return Err(CompatError::config(format!(
                "address set '{}' does not match configured address_set_name '{}'",
                address_set.name(),
                config.address_set_name
            )));
        }
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);
        Ok(Self {
            config,
            registry: Arc::new(registry),
            peers: PeerSetSync::new(address_set),
            errors: ErrorSink::new(errors_tx),
            errors_rx: Mutex::new(Some(errors_rx)),
            backend_built: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CompatConfig {
        &self.config
    }

    /// Returns the peer set synchronizer.
    #[must_use]
    pub fn peer_set(&self) -> &PeerSetSync<S> {
        &self.peers
    }

    /// Wraps the mesh's backend. Only one facade may be built.
    ///
    /// # Errors
    ///
    /// Returns [`CompatError::AlreadyInitialized`] on a second call.
    pub fn backend<B: MeshBackend>(&self, delegate: B) -> Result<CompatBackend<B, Arc<R>>> {
        if self.backend_built.swap(true, Ordering::SeqCst) {
            return Err(CompatError::already_initialized("compat backend"));
        }
        debug!("wrapping mesh backend");
        Ok(CompatBackend::new(
            delegate,
            Arc::clone(&self.registry),
            self.config.clone(),
            self.errors.clone(),
        ))
    }

    /// Starts background work and returns the aggregated error channel.
    ///
    /// Must be called from within a Tokio runtime. Failures from the address
    /// set supervisor and from the registry watch arrive on the returned
    /// channel; restarting is left to the caller. The channel ends once
    /// `cancel` fires and the background tasks have stopped.
    ///
    /// # Errors
    ///
    /// Returns the address set's error if its supervisor cannot start, or
    /// [`CompatError::AlreadyInitialized`] if already running.
    pub fn run(&self, cancel: &CancellationToken) -> Result<mpsc::Receiver<CompatError>> {
        let mut slot = self.errors_rx.lock();
        let Some(errors) = slot.take() else {
            return Err(CompatError::already_initialized("compat controller"));
        };

        let set_errors = match self.peers.run(cancel) {
            Ok(rx) => rx,
            Err(e) => {
                *slot = Some(errors);
                return Err(e);
            }
        };

        if let Some(tx) = self.errors.sender() {
            tokio::spawn(forward_errors(set_errors, tx, cancel.child_token()));
        }
        self.errors.close_on(cancel.clone());

        info!(set = %self.peers.address_set().name(), "compat controller running");
        Ok(errors)
    }

    /// Removes the peer address set. Safe to call without a prior `run`.
    ///
    /// # Errors
    ///
    /// Returns the address set's error if removal fails.
    pub fn clean_up(&self) -> Result<()> {
        self.peers.clean_up()
    }

    /// Reconciles the peer address set with `topology`.
    ///
    /// # Errors
    ///
    /// Returns the address set's error if the update fails.
    pub fn apply(&self, topology: &Topology, mode: Encapsulation, location: &str) -> Result<()> {
        self.peers.apply(topology, mode, location)
    }

    /// Returns the peer IPs the set would hold for `location`.
    #[must_use]
    pub fn peer_ips(&self, topology: &Topology, location: &str) -> Vec<IpAddr> {
        crate::peerset::peer_ips(topology, location)
    }
}

impl<R, S> fmt::Debug for Compat<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compat")
            .field("config", &self.config)
            .field("running", &self.errors_rx.lock().is_none())
            .field("backend_built", &self.backend_built.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn forward_errors(
    mut from: mpsc::Receiver<CompatError>,
    to: mpsc::Sender<CompatError>,
    cancel: CancellationToken,
) {
    loop {
        let error = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            error = from.recv() => match error {
                Some(error) => error,
                None => break,
            },
        };

        warn!(error = %error, "address set failure");
        tokio::select! {
            () = cancel.cancelled() => break,
            sent = to.send(error) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!("address set error forwarding stopped");
}
