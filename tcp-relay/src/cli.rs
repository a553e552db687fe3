use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::config::{ConfigError, Framing, RelayConfig};

/// Relay every message a TCP peer sends to all other connected peers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML file to read settings from. Flags below override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Maximum number of pending connections.
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Wire framing: length-prefixed, lines or raw.
    #[arg(long)]
    pub framing: Option<Framing>,

    /// Largest message, in bytes, a peer may send.
    #[arg(long)]
    pub max_message_len: Option<usize>,

    /// Disconnect peers that stay silent for this many seconds.
    #[arg(long)]
    pub read_timeout_secs: Option<u64>,
}

impl Cli {
    /// Loads the config file, if any, and applies the command-line overrides on top.
    pub fn resolve_config(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        if let Some(max_message_len) = self.max_message_len {
            config.max_message_len = max_message_len;
        }
        if let Some(read_timeout_secs) = self.read_timeout_secs {
            config.read_timeout_secs = Some(read_timeout_secs);
        }

        config.validate()?;
        Ok(config)
    }
}
