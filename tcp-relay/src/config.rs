//! Relay configuration.
//!
//! Settings come from an optional TOML file and are then overridden by command-line flags (see
//! [`crate::cli`]). Every field has a default, so an empty file, or no file at all, yields a
//! working relay:
//!
//! ```toml
//! listen = "0.0.0.0:1500"
//! backlog = 5
//! framing = "lines"
//! max_message_len = 255
//! read_timeout_secs = 300
//! peer_queue_depth = 64
//! ```

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest payload a 2-byte length header can describe.
pub const MAX_FRAME_LIMIT: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How message boundaries are found on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// 2-byte big-endian length header followed by the payload.
    #[default]
    LengthPrefixed,
    /// One message per `\n`-terminated line.
    Lines,
    /// Legacy: whatever a single transport read returns is one message, cut at the first NUL.
    Raw,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Framing::LengthPrefixed => "length-prefixed",
            Framing::Lines => "lines",
            Framing::Raw => "raw",
        };
        f.write_str(name)
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "length-prefixed" => Ok(Framing::LengthPrefixed),
            "lines" => Ok(Framing::Lines),
            "raw" => Ok(Framing::Raw),
            other => Err(format!(
                "unknown framing '{other}', expected one of: length-prefixed, lines, raw"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub framing: Framing,
    pub max_message_len: usize,
    pub read_timeout_secs: Option<u64>,
    pub peer_queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 1500)),
            backlog: 5,
            framing: Framing::default(),
            max_message_len: 255,
            read_timeout_secs: None,
            peer_queue_depth: 64,
        }
    }
}

impl RelayConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::Invalid {
                field: "backlog",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_message_len == 0 || self.max_message_len > MAX_FRAME_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_message_len",
                reason: format!("must be between 1 and {MAX_FRAME_LIMIT}"),
            });
        }
        if self.peer_queue_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "peer_queue_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.read_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "read_timeout_secs",
                reason: "must be positive; omit it to wait forever".to_string(),
            });
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }
}
