use std::{fmt, net::SocketAddr, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWrite,
    net::{tcp::OwnedReadHalf, TcpStream},
    select,
    sync::{broadcast, mpsc},
    time::error::Elapsed,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    codec::RelayCodec,
    config::{Framing, RelayConfig},
    error::CodecError,
    registry::PeerId,
    relay::{emit, RelayEvent},
    router::Router,
};

/// Payload a peer sends to leave the relay.
pub const SENTINEL: &[u8] = b".";

/// Why a worker stopped serving its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent the sentinel.
    Sentinel,
    /// The peer closed its side of the connection.
    Closed,
    /// Nothing arrived within the configured read timeout.
    TimedOut,
    /// The relay is shutting down.
    Shutdown,
    /// A transport or framing error.
    Error,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DisconnectReason::Sentinel => "sentinel",
            DisconnectReason::Closed => "closed",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Error => "error",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Active,
    Disconnected,
}

/// An accepted connection, handed to exactly one [`Worker`].
#[derive(Debug)]
pub struct PeerConnection {
    id: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
}

impl PeerConnection {
    pub fn new(id: PeerId, addr: SocketAddr, stream: TcpStream) -> Self {
        Self { id, addr, stream }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

enum WorkerState {
    Reading,
    Broadcasting(Bytes),
    Disconnecting(DisconnectReason),
}

type FrameReader = FramedRead<OwnedReadHalf, RelayCodec>;

/// Serves one connection: reads its messages, hands them to the [`Router`], and writes whatever
/// other peers relay to it.
pub struct Worker {
    conn: PeerConnection,
    outbound: mpsc::Receiver<Bytes>,
    router: Router,
    events: broadcast::Sender<RelayEvent>,
    shutdown: CancellationToken,
    framing: Framing,
    max_message_len: usize,
    read_timeout: Option<Duration>,
}

impl Worker {
    pub fn new(
        conn: PeerConnection,
        outbound: mpsc::Receiver<Bytes>,
        router: Router,
        events: broadcast::Sender<RelayEvent>,
        shutdown: CancellationToken,
        config: &RelayConfig,
    ) -> Self {
        Self {
            conn,
            outbound,
            router,
            events,
            shutdown,
            framing: config.framing,
            max_message_len: config.max_message_len,
            read_timeout: config.read_timeout(),
        }
    }

    /// Runs the connection to completion.
    ///
    /// However the read loop ends, the peer is removed from the registry and its writer is
    /// drained and joined before this returns. A failed write ends the read loop too.
    pub async fn run(self) -> DisconnectReason {
        let Worker {
            conn,
            outbound,
            router,
            events,
            shutdown,
            framing,
            max_message_len,
            read_timeout,
        } = self;
        let PeerConnection { id, addr, stream } = conn;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, RelayCodec::new(framing, max_message_len));
        let sink = FramedWrite::new(write_half, RelayCodec::new(framing, max_message_len));
        let write_failed = CancellationToken::new();
        let writer = tokio::spawn(write_outbound(
            id,
            sink,
            outbound,
            shutdown.clone(),
            write_failed.clone(),
        ));

        let mut session = Session {
            id,
            addr,
            state: ConnState::Active,
            router,
            events,
            shutdown,
            write_failed,
            read_timeout,
        };
        let reason = session.read_loop(&mut reader).await;
        session.disconnect(reason);

        if let Err(error) = writer.await {
            warn!(peer = %id, ?error, "writer task panicked");
        }
        reason
    }
}

/// The per-connection state a worker carries once its socket has been split.
struct Session {
    id: PeerId,
    addr: SocketAddr,
    state: ConnState,
    router: Router,
    events: broadcast::Sender<RelayEvent>,
    shutdown: CancellationToken,
    /// Cancelled by the writer task when the socket stops accepting writes.
    write_failed: CancellationToken,
    read_timeout: Option<Duration>,
}

impl Session {
    async fn read_loop(&self, reader: &mut FrameReader) -> DisconnectReason {
        let mut state = WorkerState::Reading;
        loop {
            state = match state {
                WorkerState::Reading => self.read_next(reader).await,
                WorkerState::Broadcasting(message) => {
                    self.relay(message);
                    WorkerState::Reading
                }
                WorkerState::Disconnecting(reason) => return reason,
            };
        }
    }

    async fn read_next(&self, reader: &mut FrameReader) -> WorkerState {
        let next = select! {
            _ = self.shutdown.cancelled() => {
                return WorkerState::Disconnecting(DisconnectReason::Shutdown);
            }
            _ = self.write_failed.cancelled() => {
                return WorkerState::Disconnecting(DisconnectReason::Error);
            }
            next = next_frame(reader, self.read_timeout) => next,
        };

        match next {
            Err(_) => WorkerState::Disconnecting(DisconnectReason::TimedOut),
            Ok(None) => WorkerState::Disconnecting(DisconnectReason::Closed),
            Ok(Some(Err(error))) => {
                warn!(peer = %self.id, addr = %self.addr, %error, "read failed");
                WorkerState::Disconnecting(DisconnectReason::Error)
            }
            Ok(Some(Ok(frame))) if frame.as_ref() == SENTINEL => {
                WorkerState::Disconnecting(DisconnectReason::Sentinel)
            }
            Ok(Some(Ok(frame))) if frame.is_empty() => WorkerState::Reading,
            Ok(Some(Ok(frame))) => WorkerState::Broadcasting(frame),
        }
    }

    fn relay(&self, message: Bytes) {
        info!(
            peer = %self.id,
            message = %String::from_utf8_lossy(&message),
            "relaying message"
        );
        let report = self.router.broadcast(self.id, &message);
        debug!(peer = %self.id, ?report, "broadcast complete");
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        debug_assert_eq!(self.state, ConnState::Active);
        self.state = ConnState::Disconnected;
        info!(peer = %self.id, addr = %self.addr, %reason, "peer disconnected");

        // Dropping the registry entry drops the last sender, which lets the writer drain and exit.
        self.router.registry().remove(self.id);
        emit(
            &self.events,
            RelayEvent::PeerLeft {
                peer: self.id,
                reason,
            },
        );
    }
}

async fn next_frame(
    reader: &mut FrameReader,
    read_timeout: Option<Duration>,
) -> Result<Option<Result<Bytes, CodecError>>, Elapsed> {
    match read_timeout {
        Some(duration) => tokio::time::timeout(duration, reader.next()).await,
        None => Ok(reader.next().await),
    }
}

async fn write_outbound<W>(
    peer: PeerId,
    mut sink: FramedWrite<W, RelayCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    failed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = select! {
            frame = outbound.recv() => frame,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        // A peer that stops reading must not hold up shutdown.
        let sent = select! {
            sent = sink.send(frame) => sent,
            _ = shutdown.cancelled() => return,
        };
        if let Err(error) = sent {
            // Dropping the receiver marks this peer dead for the router; the token ends its reader.
            warn!(%peer, %error, "write failed");
            failed.cancel();
            return;
        }
    }

    select! {
        closed = sink.close() => {
            if let Err(error) = closed {
                debug!(%peer, %error, "failed to close write half cleanly");
            }
        }
        _ = shutdown.cancelled() => {}
    }
}
