#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tcp_relay::{
    codec::RelayCodec,
    registry::{PeerId, Registry},
    worker::DisconnectReason,
    Relay, RelayConfig, RelayEvent,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{broadcast, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::Framed;

pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(200);

pub fn enable_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn local_config() -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..RelayConfig::default()
    }
}

/// A relay running in the background on an ephemeral port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<Registry>,
    config: RelayConfig,
    events: broadcast::Receiver<RelayEvent>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    pub async fn start(config: RelayConfig) -> Result<Self> {
        let relay = Relay::bind(config.clone())?;
        let addr = relay.local_addr()?;
        let registry = relay.registry();
        let events = relay.subscribe();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            config,
            events,
            shutdown_tx,
            server,
        })
    }

    /// Connects a new peer and waits until the relay has registered it.
    pub async fn connect(&mut self) -> Result<TestPeer> {
        let stream = TcpStream::connect(self.addr).await?;
        let local = stream.local_addr()?;

        let event = self
            .next_event(|event| matches!(event, RelayEvent::PeerJoined { addr, .. } if *addr == local))
            .await
            .context("peer was never registered")?;
        let RelayEvent::PeerJoined { peer, .. } = event else {
            unreachable!()
        };

        let codec = RelayCodec::new(self.config.framing, self.config.max_message_len);
        Ok(TestPeer {
            id: peer,
            framed: Framed::new(stream, codec),
        })
    }

    pub async fn connect_n(&mut self, n: usize) -> Result<Vec<TestPeer>> {
        let mut peers = Vec::with_capacity(n);
        for _ in 0..n {
            peers.push(self.connect().await?);
        }
        Ok(peers)
    }

    /// Skips events until one matches `predicate`.
    pub async fn next_event<P>(&mut self, predicate: P) -> Result<RelayEvent>
    where
        P: Fn(&RelayEvent) -> bool,
    {
        loop {
            let event = match timeout(WAIT, self.events.recv()).await {
                Ok(Ok(event)) => event,
                // Busy tests outrun the event channel; older events are not needed.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => return Err(anyhow!("timed out waiting for relay event")),
            };
            if predicate(&event) {
                return Ok(event);
            }
        }
    }

    pub async fn peer_left(&mut self, peer: PeerId) -> Result<DisconnectReason> {
        let event = self
            .next_event(|event| matches!(event, RelayEvent::PeerLeft { peer: left, .. } if *left == peer))
            .await?;
        match event {
            RelayEvent::PeerLeft { reason, .. } => Ok(reason),
            other => Err(anyhow!("unexpected event {other:?}")),
        }
    }

    pub async fn relayed_from(&mut self, from: PeerId) -> Result<(usize, usize)> {
        let event = self
            .next_event(|event| matches!(event, RelayEvent::MessageRelayed { from: sender, .. } if *sender == from))
            .await?;
        match event {
            RelayEvent::MessageRelayed {
                len, recipients, ..
            } => Ok((len, recipients)),
            other => Err(anyhow!("unexpected event {other:?}")),
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        timeout(WAIT, self.server)
            .await
            .context("relay did not shut down")??;
        Ok(())
    }
}

/// A client connection speaking the relay's framing.
pub struct TestPeer {
    pub id: PeerId,
    framed: Framed<TcpStream, RelayCodec>,
}

impl TestPeer {
    pub async fn send(&mut self, message: &[u8]) -> Result<()> {
        self.framed.send(Bytes::copy_from_slice(message)).await?;
        Ok(())
    }

    /// Writes bytes to the socket as-is, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.framed.get_mut().write_all(bytes).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Bytes> {
        match timeout(WAIT, self.framed.next()).await {
            Ok(Some(frame)) => Ok(frame?),
            Ok(None) => Err(anyhow!("peer {} connection closed", self.id)),
            Err(_) => Err(anyhow!("peer {} timed out waiting for a message", self.id)),
        }
    }

    pub async fn assert_silent(&mut self) {
        if let Ok(frame) = timeout(QUIET, self.framed.next()).await {
            panic!("peer {} expected nothing, got {frame:?}", self.id);
        }
    }

    pub async fn assert_closed(&mut self) -> Result<()> {
        match timeout(WAIT, self.framed.next()).await {
            Ok(None) => Ok(()),
            Ok(Some(frame)) => Err(anyhow!("expected close, got {frame:?}")),
            Err(_) => Err(anyhow!("peer {} was never closed", self.id)),
        }
    }
}
