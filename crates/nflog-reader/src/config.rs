//! Socket configuration
//!
//! A [`SocketConfig`] is built by the caller (directly, from a TOML file, or
//! from command-line flags) and consumed by [`crate::NflogSocket::open`].
//! Changing it later requires closing and reopening the socket.
//!
//! Default location: /etc/nflog-reader.toml

use crate::error::{NflogError, Result};
use crate::message::{NFULNL_CFG_F_CONNTRACK, NFULNL_CFG_F_SEQ, NFULNL_CFG_F_SEQ_GLOBAL};
use crate::types::{CopyMode, LogGroup, OverflowMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nflog-reader.toml";

/// Largest receive buffer the kernel accepts through `SO_RCVBUFFORCE`
/// (the value is doubled internally and must stay below `INT_MAX`)
pub const MAX_SOCKET_BUFFER_BYTES: u32 = 1_073_741_823;

/// Optional per-message sequence numbers and conntrack info
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceFlags {
    /// Per-group sequence number (`NFULA_SEQ`)
    #[serde(default)]
    pub seq: bool,

    /// Global sequence number (`NFULA_SEQ_GLOBAL`)
    #[serde(default)]
    pub seq_global: bool,

    /// Attach conntrack information (`NFULA_CT`, `NFULA_CT_INFO`)
    #[serde(default)]
    pub conntrack: bool,
}

impl SequenceFlags {
    /// `NFULNL_CFG_F_*` bitmask
    pub fn bits(&self) -> u16 {
        let mut bits = 0;
        if self.seq {
            bits |= NFULNL_CFG_F_SEQ;
        }
        if self.seq_global {
            bits |= NFULNL_CFG_F_SEQ_GLOBAL;
        }
        if self.conntrack {
            bits |= NFULNL_CFG_F_CONNTRACK;
        }
        bits
    }
}

/// Complete socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Logging group to bind
    #[serde(default)]
    pub group: LogGroup,

    /// Receive timeout in milliseconds; absent blocks indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u64>,

    /// Messages the kernel queues before waking the reader
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: u32,

    /// Reaction to dropped messages
    #[serde(default)]
    pub overflow_mode: OverflowMode,

    /// Socket receive buffer override in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_buffer_bytes: Option<u32>,

    /// How much of each packet is copied
    #[serde(default)]
    pub copy_mode: CopyMode,

    /// Bytes of packet payload copied in `Packet` mode
    #[serde(default = "default_copy_range")]
    pub copy_range: u32,

    /// Kernel flush timer in 1/100 s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_timeout_cs: Option<u32>,

    /// Kernel-side netlink buffer size (`nlbufsiz`) in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netlink_buffer_bytes: Option<u32>,

    #[serde(default)]
    pub sequence: SequenceFlags,
}

fn default_queue_threshold() -> u32 {
    1
}

fn default_copy_range() -> u32 {
    0xffff
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            group: LogGroup::default(),
            receive_timeout_ms: None,
            queue_threshold: default_queue_threshold(),
            overflow_mode: OverflowMode::default(),
            socket_buffer_bytes: None,
            copy_mode: CopyMode::default(),
            copy_range: default_copy_range(),
            flush_timeout_cs: None,
            netlink_buffer_bytes: None,
            sequence: SequenceFlags::default(),
        }
    }
}

impl SocketConfig {
    /// Defaults for `group`
    pub fn new(group: impl Into<LogGroup>) -> Self {
        Self {
            group: group.into(),
            ..Self::default()
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_queue_threshold(mut self, threshold: u32) -> Self {
        self.queue_threshold = threshold;
        self
    }

    pub fn with_overflow_mode(mut self, mode: OverflowMode) -> Self {
        self.overflow_mode = mode;
        self
    }

    pub fn with_socket_buffer_bytes(mut self, bytes: u32) -> Self {
        self.socket_buffer_bytes = Some(bytes);
        self
    }

    pub fn with_copy_mode(mut self, mode: CopyMode, range: u32) -> Self {
        self.copy_mode = mode;
        self.copy_range = range;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        let cs = timeout.as_millis() / 10;
        self.flush_timeout_cs = Some(u32::try_from(cs).unwrap_or(u32::MAX));
        self
    }

    /// Receive timeout as Duration, `None` for blocking
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }

    /// Kernel flush timer as Duration
    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout_cs
            .map(|cs| Duration::from_millis(u64::from(cs) * 10))
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = toml::from_str(&content).map_err(|e| {
                    NflogError::Config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(NflogError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NflogError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate ranges the type system does not already enforce
    pub fn validate(&self) -> Result<()> {
        if self.queue_threshold == 0 {
            return Err(NflogError::invalid_config(
                "queue_threshold",
                "must be at least 1",
            ));
        }

        if let Some(bytes) = self.socket_buffer_bytes {
            if bytes == 0 || bytes > MAX_SOCKET_BUFFER_BYTES {
                return Err(NflogError::invalid_config(
                    "socket_buffer_bytes",
                    format!("{bytes} is outside 1..={MAX_SOCKET_BUFFER_BYTES}"),
                ));
            }
        }

        if self.netlink_buffer_bytes == Some(0) {
            return Err(NflogError::invalid_config(
                "netlink_buffer_bytes",
                "must be greater than 0",
            ));
        }

        if self.copy_mode == CopyMode::Packet && self.copy_range == 0 {
            return Err(NflogError::invalid_config(
                "copy_range",
                "must be greater than 0 in packet copy mode",
            ));
        }

        Ok(())
    }
}
