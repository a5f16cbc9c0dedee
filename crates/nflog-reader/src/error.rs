//! Error types for nflog-reader
//!
//! Decode errors (`MalformedAttribute`, `MalformedMessage`) and `Overflow`
//! are local to one receive call; the socket stays usable afterwards.
//! `Open` is fatal to the handle being opened. A receive timeout is not an
//! error and never shows up here.

use std::io;
use thiserror::Error;

/// Errors that can occur while opening, configuring or reading an nflog socket
#[derive(Debug, Error)]
pub enum NflogError {
    /// Socket creation, bind or kernel configuration failed
    #[error("Failed to open nflog socket: {context}: {source}")]
    Open {
        /// The step that failed (e.g. "bind group 5")
        context: String,
        #[source]
        source: io::Error,
    },

    /// A configuration value is out of range
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// The attribute region of a message violates the TLV format
    #[error("Malformed attribute at offset {offset}: {reason}")]
    MalformedAttribute { offset: usize, reason: String },

    /// A netlink message header is truncated or inconsistent
    #[error("Malformed netlink message at offset {offset}: {reason}")]
    MalformedMessage { offset: usize, reason: String },

    /// The kernel dropped log messages because the socket was not drained
    #[error("Kernel dropped log messages (ENOBUFS)")]
    Overflow,

    /// The handle was closed, or closed while a receive was blocked
    #[error("nflog handle is closed")]
    Closed,

    /// The kernel answered a request with a netlink error
    #[error("Netlink error reported by kernel: {}", errno_message(.errno))]
    Kernel { errno: i32 },

    /// A textual dump could not be parsed
    #[error("Dump parse error at line {line}: {message}")]
    DumpParse { line: usize, message: String },

    /// Configuration file could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl NflogError {
    pub(crate) fn open(context: impl Into<String>, source: io::Error) -> Self {
        Self::Open {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid_config(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// True for errors after which the same handle can be received from again
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedAttribute { .. }
                | Self::MalformedMessage { .. }
                | Self::Overflow
                | Self::Kernel { .. }
        )
    }
}

fn errno_message(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

/// Result type alias for nflog-reader operations
pub type Result<T> = std::result::Result<T, NflogError>;
