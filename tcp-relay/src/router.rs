use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc::error::TrySendError};
use tracing::{debug, warn};

use crate::{
    registry::{PeerId, Registry},
    relay::{emit, RelayEvent},
};

/// Outcome of a single [`Router::broadcast`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the message was queued for.
    pub delivered: usize,
    /// Peers skipped because their outbound queue was full.
    pub dropped: usize,
    /// Peers whose writer had already gone away and were removed from the registry.
    pub pruned: usize,
}

/// Fans a message out to every registered peer except its sender.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    events: broadcast::Sender<RelayEvent>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, events: broadcast::Sender<RelayEvent>) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Queues `message` for every peer but `sender`.
    ///
    /// Delivery is best-effort: a full or closed queue is logged and skipped, and never stops
    /// delivery to the remaining peers. Peers with a closed queue are pruned afterwards.
    pub fn broadcast(&self, sender: PeerId, message: &Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();

        self.registry.for_each_except(sender, |id, peer| {
            // Cheap, the backing storage is shared.
            match peer.outbound.try_send(message.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    debug!(from = %sender, to = %id, len = message.len(), "queued message");
                }
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!(from = %sender, to = %id, addr = %peer.addr, "outbound queue full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(from = %sender, to = %id, addr = %peer.addr, "peer writer is gone, pruning");
                    dead.push(id);
                }
            }
        });

        for id in dead {
            if self.registry.remove(id).is_some() {
                report.pruned += 1;
            }
        }

        emit(
            &self.events,
            RelayEvent::MessageRelayed {
                from: sender,
                len: message.len(),
                recipients: report.delivered,
            },
        );

        report
    }
}
