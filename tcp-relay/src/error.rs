use std::{io, net::SocketAddr};

use thiserror::Error;

/// Errors raised by the listener.
///
/// Only [`RelayError::Bind`] and [`RelayError::Listen`] are fatal; accept failures are logged by
/// the accept loop and never returned from it.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to create socket for {addr}: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listen failed on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Errors raised while framing a single connection's byte stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}
