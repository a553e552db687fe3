use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::{broadcast, mpsc},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    error::RelayError,
    registry::{PeerHandle, PeerId, Registry},
    router::Router,
    worker::{DisconnectReason, PeerConnection, Worker},
};

// Lagging subscribers miss events rather than slowing the relay down.
const EVENT_CAPACITY: usize = 128;

// Pause after a failed accept so persistent failures (e.g. fd exhaustion) don't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle notifications for anyone observing the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    PeerJoined {
        peer: PeerId,
        addr: SocketAddr,
    },
    MessageRelayed {
        from: PeerId,
        len: usize,
        recipients: usize,
    },
    PeerLeft {
        peer: PeerId,
        reason: DisconnectReason,
    },
}

pub(crate) fn emit(events: &broadcast::Sender<RelayEvent>, event: RelayEvent) {
    // Sending only fails when nobody is subscribed, which is the usual case.
    let _ = events.send(event);
}

/// The listening side of the relay.
pub struct Relay {
    listener: TcpListener,
    config: RelayConfig,
    registry: Arc<Registry>,
    events: broadcast::Sender<RelayEvent>,
}

impl Relay {
    /// Binds and starts listening on `config.listen` with `config.backlog` pending connections.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let addr = config.listen;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| RelayError::Socket { addr, source })?;

        #[cfg(unix)]
        socket
            .set_reuseaddr(true)
            .map_err(|source| RelayError::Socket { addr, source })?;

        socket
            .bind(addr)
            .map_err(|source| RelayError::Bind { addr, source })?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|source| RelayError::Listen { addr, source })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            listener,
            config,
            registry: Arc::new(Registry::new()),
            events,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.listener.local_addr().map_err(RelayError::LocalAddr)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// A handle on the live peer registry, usable after the relay has been moved into `run_*`.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Accepts connections until `shutdown` resolves, then cancels every worker and waits for
    /// all of them to finish.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            config,
            registry,
            events,
        } = self;
        let router = Router::new(Arc::clone(&registry), events.clone());
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let worker = register(stream, addr, &config, &router, &events, &cancel);
                        workers.spawn(worker.run());
                    }
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = workers.join_next(), if !workers.is_empty() => reap(finished),
            }
        }

        info!(peers = registry.len(), "relay shutting down");
        cancel.cancel();
        while let Some(finished) = workers.join_next().await {
            reap(finished);
        }
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(?error, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn register(
    stream: TcpStream,
    addr: SocketAddr,
    config: &RelayConfig,
    router: &Router,
    events: &broadcast::Sender<RelayEvent>,
    cancel: &CancellationToken,
) -> Worker {
    let (outbound_tx, outbound_rx) = mpsc::channel(config.peer_queue_depth);
    let registry = router.registry();
    let peer = registry.add(PeerHandle::new(addr, outbound_tx));

    info!(%peer, %addr, peers = registry.len(), "peer connected");
    emit(events, RelayEvent::PeerJoined { peer, addr });

    Worker::new(
        PeerConnection::new(peer, addr, stream),
        outbound_rx,
        router.clone(),
        events.clone(),
        cancel.child_token(),
        config,
    )
}

fn reap(finished: Result<DisconnectReason, JoinError>) {
    match finished {
        Ok(reason) => debug!(%reason, "worker finished"),
        Err(error) => warn!(?error, "worker task failed"),
    }
}
