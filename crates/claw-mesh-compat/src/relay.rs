//! Forwarding of mesh node events, translated against the registry cache.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::NodeCache;
use crate::translate::translate_event;
use crate::types::{NodeEvent, NodeEventStream};

/// Relays events from the delegate backend to the outbound channel.
///
/// Events are forwarded one at a time in arrival order. A full outbound
/// channel stalls the relay, and with it consumption of the upstream stream.
#[derive(Debug)]
pub struct EventRelay {
    cache: Arc<NodeCache>,
    upstream: NodeEventStream,
    outbound: mpsc::Sender<NodeEvent>,
    private_ip_key: String,
}

impl EventRelay {
    /// Creates a relay from `upstream` to `outbound`.
    #[must_use]
    pub fn new(
        cache: Arc<NodeCache>,
        upstream: NodeEventStream,
        outbound: mpsc::Sender<NodeEvent>,
        private_ip_key: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            upstream,
            outbound,
            private_ip_key: private_ip_key.into(),
        }
    }

    /// Runs the relay on a background task until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Runs the relay until `cancel` fires or either channel closes.
    ///
    /// An event in flight when cancellation fires may be dropped. The
    /// outbound sender is dropped on return, closing the channel.
    pub async fn run(self, cancel: CancellationToken) {
        info!("node event relay started");
        let mut forwarded: u64 = 0;

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = self.upstream.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("upstream node events closed");
                        break;
                    }
                },
            };

            let translated = translate_event(&self.cache, event, &self.private_ip_key);
            debug!(
                node = %translated.node.name,
                kind = %translated.kind,
                "relaying node event"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sent = self.outbound.send(translated) => {
                    if sent.is_err() {
                        debug!("outbound node events dropped by consumer");
                        break;
                    }
                    forwarded += 1;
                }
            }
        }

        info!(forwarded, "node event relay stopped");
    }
}
