//! nflog socket manager
//!
//! [`NflogSocket`] owns one transport exclusively and drives the receive
//! loop: wait for a datagram (bounded by the configured timeout), run the
//! overflow policy, then assemble the datagram into a [`Batch`].
//!
//! The transport is released exactly once, on the first of [`NflogSocket::close`],
//! the end of [`NflogSocket::scoped`], cancellation, or drop.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-12: Audit Record Generation - Packets logged by the firewall are collected here
//! - SI-4: System Monitoring - Dropped log messages are counted or surfaced
//! - SC-5: Denial of Service Protection - Every receive is bounded by timeout

use crate::config::SocketConfig;
use crate::error::{NflogError, Result};
use crate::message::scan_batch;
use crate::overflow::{OverflowAction, OverflowPolicy, OverflowState, MAX_OVERFLOW_RETRIES};
use crate::transport::{Canceller, NetlinkTransport, RecvEvent, Transport};
use crate::types::{Batch, LogGroup, PacketRecord};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Handle to one nflog logging group
pub struct NflogSocket<T: Transport = NetlinkTransport> {
    transport: Option<T>,
    group: LogGroup,
    receive_timeout: Option<Duration>,
    policy: OverflowPolicy,
    cancel: Canceller,
    buffer: Vec<u8>,
    /// Records that arrived with an overflow marker in `Raise` mode
    pending: Option<Batch>,
    receives: u64,
}

impl NflogSocket<NetlinkTransport> {
    /// Open a netlink socket and bind it to `config.group`
    ///
    /// # NIST Controls
    /// - AC-3: Access Enforcement - Requires CAP_NET_ADMIN
    #[instrument(skip(config), fields(group = %config.group))]
    pub fn open(config: SocketConfig) -> Result<Self> {
        config.validate()?;
        let transport = NetlinkTransport::open(&config)?;
        let socket = Self::with_transport(config, transport)?;
        info!(
            overflow_mode = ?socket.policy.mode(),
            "nflog socket opened"
        );
        Ok(socket)
    }

    /// Open, run `f`, and close on every exit path
    pub fn scoped<R>(config: SocketConfig, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let mut socket = Self::open(config)?;
        let result = f(&mut socket);
        socket.close();
        result
    }
}

impl<T: Transport> NflogSocket<T> {
    /// Socket manager over an arbitrary transport
    pub fn with_transport(config: SocketConfig, transport: T) -> Result<Self> {
        config.validate()?;
        debug!(group = %config.group, "Creating nflog socket manager");
        Ok(Self {
            transport: Some(transport),
            group: config.group,
            receive_timeout: config.receive_timeout(),
            policy: OverflowPolicy::new(config.overflow_mode),
            cancel: Canceller::new(),
            buffer: Vec::new(),
            pending: None,
            receives: 0,
        })
    }

    /// [`NflogSocket::scoped`] over an arbitrary transport
    pub fn scoped_with<R>(
        config: SocketConfig,
        transport: T,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let mut socket = Self::with_transport(config, transport)?;
        let result = f(&mut socket);
        socket.close();
        result
    }

    /// Receive one batch
    ///
    /// - timeout without data: `Ok` with an empty batch
    /// - overflow: handled per [`crate::OverflowMode`]
    /// - malformed datagram: the decode error, the socket stays usable
    /// - closed or cancelled: [`NflogError::Closed`]
    #[instrument(skip(self), fields(group = %self.group))]
    pub fn receive(&mut self) -> Result<Batch> {
        if self.cancel.is_cancelled() {
            self.close();
            return Err(NflogError::Closed);
        }
        if let Some(batch) = self.pending.take() {
            debug!(records = batch.len(), "Returning records held back by overflow");
            self.policy.on_receive();
            return Ok(batch);
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(NflogError::Closed);
        };

        let deadline = self.receive_timeout.map(|t| Instant::now() + t);
        let mut absorbed = 0u32;

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));

            match transport.recv(&mut self.buffer, remaining, &self.cancel)? {
                RecvEvent::Datagram => {
                    self.receives += 1;
                    let scan = scan_batch(&self.buffer);
                    let overflows = scan.overflows;

                    let mut action = OverflowAction::Continue;
                    for _ in 0..overflows {
                        action = self.policy.on_overflow();
                    }
                    let decoded = scan.decode();

                    if action == OverflowAction::Raise {
                        match decoded {
                            Ok(records) if !records.is_empty() => self.pending = Some(records),
                            Ok(_) => {}
                            Err(err) => {
                                warn!(error = %err, "Dropping malformed datagram behind overflow")
                            }
                        }
                        return Err(NflogError::Overflow);
                    }

                    let records = decoded?;
                    if overflows > 0 && records.is_empty() {
                        absorbed += 1;
                        if absorbed >= MAX_OVERFLOW_RETRIES {
                            warn!(absorbed, "Giving up after repeated overflows");
                            return Ok(Batch::new());
                        }
                        continue;
                    }

                    self.policy.on_receive();
                    trace!(records = records.len(), "Received batch");
                    return Ok(records);
                }
                RecvEvent::Truncated(len) => {
                    return Err(NflogError::MalformedMessage {
                        offset: 0,
                        reason: format!(
                            "datagram of {len} bytes truncated to {}",
                            self.buffer.len()
                        ),
                    });
                }
                RecvEvent::TimedOut => {
                    trace!("Receive timed out");
                    self.policy.on_receive();
                    return Ok(Batch::new());
                }
                RecvEvent::Overflow => match self.policy.on_overflow() {
                    OverflowAction::Raise => return Err(NflogError::Overflow),
                    OverflowAction::Continue => {
                        absorbed += 1;
                        if absorbed >= MAX_OVERFLOW_RETRIES {
                            warn!(absorbed, "Giving up after repeated overflows");
                            return Ok(Batch::new());
                        }
                    }
                },
                RecvEvent::Closed => {
                    self.close();
                    return Err(NflogError::Closed);
                }
            }
        }
    }

    /// Perform exactly `count` receives, keeping empty batches
    pub fn receive_count(&mut self, count: usize) -> Result<Vec<Batch>> {
        (0..count).map(|_| self.receive()).collect()
    }

    /// Batches until the socket is closed or cancelled
    pub fn batches(&mut self) -> Batches<'_, T> {
        Batches { socket: self }
    }

    /// Records one at a time, in arrival order, until the socket is closed
    /// or cancelled
    ///
    /// Empty batches are skipped, so on an idle group this keeps waiting.
    pub fn records(&mut self) -> Records<'_, T> {
        Records {
            socket: self,
            current: Vec::new().into_iter(),
        }
    }

    /// Release the transport; later calls are no-ops
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            self.pending = None;
            info!(group = %self.group, receives = self.receives, "nflog socket closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Handle that interrupts a receive blocked on another thread
    pub fn canceller(&self) -> Canceller {
        self.cancel.clone()
    }

    pub fn group(&self) -> LogGroup {
        self.group
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    /// Overflow count, only in `Handle` mode
    pub fn drops(&self) -> Option<u64> {
        self.policy.drops()
    }

    pub fn reset_drops(&mut self) {
        self.policy.reset_drops();
    }

    pub fn overflow_state(&self) -> OverflowState {
        self.policy.state()
    }

    /// Datagrams received so far
    pub fn receives(&self) -> u64 {
        self.receives
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(Transport::raw_fd)
    }

    /// Kernel-reported usable receive buffer (`SO_RCVBUF / 2`)
    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.transport.as_ref().and_then(Transport::receive_buffer_size)
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }
}

impl<T: Transport> Drop for NflogSocket<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> std::fmt::Debug for NflogSocket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NflogSocket")
            .field("group", &self.group)
            .field("closed", &self.is_closed())
            .field("receive_timeout", &self.receive_timeout)
            .field("policy", &self.policy)
            .field("receives", &self.receives)
            .finish()
    }
}

/// Iterator over batches, ending when the socket is closed
pub struct Batches<'a, T: Transport> {
    socket: &'a mut NflogSocket<T>,
}

impl<T: Transport> Iterator for Batches<'_, T> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.socket.receive() {
            Err(NflogError::Closed) => None,
            other => Some(other),
        }
    }
}

/// Iterator over single records, ending when the socket is closed
pub struct Records<'a, T: Transport> {
    socket: &'a mut NflogSocket<T>,
    current: std::vec::IntoIter<PacketRecord>,
}

impl<T: Transport> Iterator for Records<'_, T> {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            match self.socket.receive() {
                Ok(batch) => self.current = batch.into_iter(),
                Err(NflogError::Closed) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
