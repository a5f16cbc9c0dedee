//! Kernel buffer overflow policy
//!
//! The kernel reports dropped log messages either as an `ENOBUFS` receive
//! error or as an overflow marker inside a datagram. The policy decides
//! whether the receive call keeps going or surfaces the condition, and keeps
//! the per-socket drop counter.
//!
//! State is owned by a single socket; two sockets never share a counter.

use crate::types::OverflowMode;
use tracing::{debug, warn};

/// Upper bound on consecutive overflow events absorbed inside one receive
/// call before it gives up and returns an empty batch
pub const MAX_OVERFLOW_RETRIES: u32 = 64;

/// Overflow state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowState {
    /// Last receive completed without an overflow event
    Normal,
    /// An overflow was reported and no receive has succeeded since
    Overflowed,
}

/// What the receive loop must do after an overflow event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowAction {
    /// Keep receiving within the same call
    Continue,
    /// Return [`crate::NflogError::Overflow`]
    Raise,
}

/// Per-socket overflow policy
#[derive(Debug, Clone)]
pub struct OverflowPolicy {
    mode: OverflowMode,
    state: OverflowState,
    drops: u64,
}

impl OverflowPolicy {
    pub fn new(mode: OverflowMode) -> Self {
        Self {
            mode,
            state: OverflowState::Normal,
            drops: 0,
        }
    }

    pub fn mode(&self) -> OverflowMode {
        self.mode
    }

    pub fn state(&self) -> OverflowState {
        self.state
    }

    pub fn is_overflowed(&self) -> bool {
        self.state == OverflowState::Overflowed
    }

    /// Record one overflow event and decide how the caller proceeds
    pub fn on_overflow(&mut self) -> OverflowAction {
        let was_normal = self.state == OverflowState::Normal;
        self.state = OverflowState::Overflowed;

        match self.mode {
            OverflowMode::Ignore => {
                debug!("Ignoring nflog overflow");
                OverflowAction::Continue
            }
            OverflowMode::Handle => {
                self.drops = self.drops.saturating_add(1);
                if was_normal {
                    warn!(drops = self.drops, "Kernel dropped nflog messages");
                } else {
                    debug!(drops = self.drops, "Kernel dropped nflog messages again");
                }
                OverflowAction::Continue
            }
            OverflowMode::Raise => OverflowAction::Raise,
        }
    }

    /// A receive completed with data or a plain timeout
    pub fn on_receive(&mut self) {
        if self.state == OverflowState::Overflowed {
            debug!("nflog overflow cleared");
            self.state = OverflowState::Normal;
        }
    }

    /// Number of overflow events counted, only tracked in `Handle` mode
    pub fn drops(&self) -> Option<u64> {
        match self.mode {
            OverflowMode::Handle => Some(self.drops),
            OverflowMode::Ignore | OverflowMode::Raise => None,
        }
    }

    pub fn reset_drops(&mut self) {
        self.drops = 0;
    }

    /// Back to `Normal` with a zero counter
    pub fn reset(&mut self) {
        self.state = OverflowState::Normal;
        self.drops = 0;
    }
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::new(OverflowMode::default())
    }
}
