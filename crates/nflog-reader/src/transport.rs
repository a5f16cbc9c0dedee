//! Datagram transports behind [`crate::NflogSocket`]
//!
//! [`NetlinkTransport`] talks to the kernel over an `AF_NETLINK` /
//! `NETLINK_NETFILTER` socket. [`ReplayTransport`] feeds recorded or
//! synthetic datagrams through the same receive path without a kernel.
//!
//! Both observe a [`Canceller`] while they wait, so another thread can
//! interrupt a blocked receive.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Kernel netlink interface
//! - SC-5: Denial of Service Protection - Receives are bounded by timeout and cancellation

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::message::{encode_batch, encode_error, encode_overrun};
use crate::types::Batch;

#[cfg(target_os = "linux")]
pub use linux::NetlinkTransport;
#[cfg(not(target_os = "linux"))]
pub use unsupported::NetlinkTransport;

/// Outcome of one [`Transport::recv`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvEvent {
    /// A datagram was written to the buffer
    Datagram,
    /// The datagram did not fit; the kernel reported this many bytes
    Truncated(usize),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The kernel reported dropped messages (`ENOBUFS`)
    Overflow,
    /// Cancelled, or nothing more will ever arrive
    Closed,
}

/// Source of raw netlink datagrams
pub trait Transport: Send {
    /// Wait up to `timeout` (forever when `None`) for one datagram and write
    /// it to `buf`, replacing its contents
    fn recv(
        &mut self,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
        cancel: &Canceller,
    ) -> io::Result<RecvEvent>;

    /// Release the underlying resources; called at most once
    fn close(&mut self);

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Usable receive buffer size as reported by the kernel
    fn receive_buffer_size(&self) -> Option<usize> {
        None
    }
}

/// Cross-thread handle that interrupts a blocked receive
///
/// Cancellation is permanent: once cancelled, every later receive on the
/// owning socket returns [`crate::NflogError::Closed`].
#[derive(Debug, Clone)]
pub struct Canceller {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    /// eventfd polled next to the netlink socket
    #[cfg(target_os = "linux")]
    wake: Option<std::os::fd::OwnedFd>,
}

impl Canceller {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                cond: Condvar::new(),
                #[cfg(target_os = "linux")]
                wake: linux::wake_fd(),
            }),
        }
    }

    /// Wake any thread blocked in receive; the socket is then released
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("nflog receive cancelled");
        {
            let _guard = self.inner.lock.lock();
            self.inner.cond.notify_all();
        }
        #[cfg(target_os = "linux")]
        if let Some(fd) = &self.inner.wake {
            linux::signal_wake_fd(fd);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// File descriptor that becomes readable on cancellation
    pub fn wake_fd(&self) -> Option<RawFd> {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            self.inner.wake.as_ref().map(AsRawFd::as_raw_fd)
        }
        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }

    /// Sleep up to `timeout` or until cancelled; true when cancelled
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.cond.wait(&mut guard),
            }
        }
        self.is_cancelled()
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

/// One scripted event of a [`ReplayTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEvent {
    Datagram(Vec<u8>),
    /// `ENOBUFS` from the receive call itself
    Overflow,
    /// No data: the receive waits out its timeout
    Silence,
}

/// Transport that replays scripted datagrams
///
/// Once the script is exhausted every receive reports [`RecvEvent::Closed`].
#[derive(Debug, Default)]
pub struct ReplayTransport {
    events: VecDeque<ReplayEvent>,
    closed: bool,
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// One datagram per batch, in order
    pub fn from_batches(batches: impl IntoIterator<Item = Batch>) -> Self {
        let mut transport = Self::new();
        for batch in batches {
            transport.push_batch(&batch);
        }
        transport
    }

    pub fn push_datagram(&mut self, datagram: impl Into<Vec<u8>>) -> &mut Self {
        self.events.push_back(ReplayEvent::Datagram(datagram.into()));
        self
    }

    pub fn push_batch(&mut self, batch: &Batch) -> &mut Self {
        self.push_datagram(encode_batch(batch))
    }

    /// `ENOBUFS` reported by the receive call
    pub fn push_overflow(&mut self) -> &mut Self {
        self.events.push_back(ReplayEvent::Overflow);
        self
    }

    /// Overflow marker delivered inside a datagram (`NLMSG_OVERRUN`)
    pub fn push_overrun_marker(&mut self) -> &mut Self {
        self.push_datagram(encode_overrun(0))
    }

    /// `NLMSG_ERROR` with `-errno` delivered inside a datagram
    pub fn push_kernel_error(&mut self, errno: i32) -> &mut Self {
        self.push_datagram(encode_error(errno, 0))
    }

    pub fn push_silence(&mut self) -> &mut Self {
        self.events.push_back(ReplayEvent::Silence);
        self
    }

    /// Events not yet consumed
    pub fn remaining(&self) -> usize {
        self.events.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for ReplayTransport {
    fn recv(
        &mut self,
        buf: &mut Vec<u8>,
        timeout: Option<Duration>,
        cancel: &Canceller,
    ) -> io::Result<RecvEvent> {
        if self.closed || cancel.is_cancelled() {
            return Ok(RecvEvent::Closed);
        }

        match self.events.pop_front() {
            Some(ReplayEvent::Datagram(datagram)) => {
                trace!(len = datagram.len(), "Replaying datagram");
                *buf = datagram;
                Ok(RecvEvent::Datagram)
            }
            Some(ReplayEvent::Overflow) => Ok(RecvEvent::Overflow),
            Some(ReplayEvent::Silence) => {
                if cancel.wait(timeout) {
                    Ok(RecvEvent::Closed)
                } else {
                    Ok(RecvEvent::TimedOut)
                }
            }
            None => {
                debug!("Replay exhausted");
                Ok(RecvEvent::Closed)
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.events.clear();
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{Canceller, RecvEvent, Transport};
    use crate::config::SocketConfig;
    use crate::error::{NflogError, Result};
    use crate::message::{self, ConfigAttr, ConfigCommand};
    use crate::types::OverflowMode;
    use netlink_sys::{protocols::NETLINK_NETFILTER, Socket};
    use std::collections::VecDeque;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::time::{Duration, Instant};
    use tracing::{debug, instrument, trace, warn};

    /// Receive buffer per datagram (the kernel batches up to `nlbufsiz`)
    const RECV_BUFFER_SIZE: usize = 256 * 1024;

    /// How long to wait for the kernel to acknowledge a config request
    const ACK_TIMEOUT: Duration = Duration::from_secs(2);

    /// Poll slice used when no eventfd is available for cancellation
    const CANCEL_POLL_SLICE: Duration = Duration::from_millis(100);

    pub(super) fn wake_fd() -> Option<OwnedFd> {
        // SAFETY: eventfd has no memory preconditions; the fd is owned below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            warn!(
                error = %io::Error::last_os_error(),
                "eventfd unavailable, cancellation falls back to polling"
            );
            return None;
        }
        // SAFETY: fd was just returned by eventfd and is not owned elsewhere.
        Some(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub(super) fn signal_wake_fd(fd: &OwnedFd) {
        let one: u64 = 1;
        // SAFETY: writes 8 bytes from a live u64 to an eventfd.
        let ret = unsafe {
            libc::write(
                fd.as_raw_fd(),
                (&one as *const u64).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            warn!(error = %io::Error::last_os_error(), "Failed to signal cancellation eventfd");
        }
    }

    /// Netlink socket bound to one nflog group
    pub struct NetlinkTransport {
        socket: Option<Socket>,
        seq: u32,
        /// Datagrams that arrived while waiting for an acknowledgement
        backlog: VecDeque<Vec<u8>>,
        buffer_size: usize,
    }

    impl NetlinkTransport {
        /// Create the socket and apply `config` to the kernel logger
        ///
        /// # NIST Controls
        /// - AC-3: Access Enforcement - Binding a group requires CAP_NET_ADMIN
        #[instrument(skip(config), fields(group = %config.group))]
        pub fn open(config: &SocketConfig) -> Result<Self> {
            let mut socket = Socket::new(NETLINK_NETFILTER)
                .map_err(|e| NflogError::open("create netlink socket", e))?;
            socket
                .bind_auto()
                .map_err(|e| NflogError::open("bind netlink socket", e))?;

            let mut transport = Self {
                socket: Some(socket),
                seq: 0,
                backlog: VecDeque::new(),
                buffer_size: RECV_BUFFER_SIZE,
            };
            transport.configure(config)?;

            debug!(backlog = transport.backlog.len(), "nflog socket configured");
            Ok(transport)
        }

        fn configure(&mut self, config: &SocketConfig) -> Result<()> {
            let group = config.group.id();
            let unspec = libc::AF_UNSPEC as u8;

            match self.request(
                libc::AF_INET as u8,
                0,
                ConfigAttr::Command(ConfigCommand::PfBind),
            ) {
                Ok(()) => {}
                // Already bound by another logger, or a kernel where the
                // command is a no-op that still reports it.
                Err(e) if matches!(e.raw_os_error(), Some(libc::EEXIST) | Some(libc::EBUSY)) => {
                    debug!(error = %e, "AF_INET already bound to nfnetlink_log")
                }
                Err(e) => return Err(NflogError::open("bind protocol family AF_INET", e)),
            }

            self.request(unspec, group, ConfigAttr::Command(ConfigCommand::Bind))
                .map_err(|e| NflogError::open(format!("bind group {group}"), e))?;

            self.request(
                unspec,
                group,
                ConfigAttr::Mode {
                    copy_mode: config.copy_mode,
                    copy_range: config.copy_range,
                },
            )
            .map_err(|e| NflogError::open("set copy mode", e))?;

            self.request(
                unspec,
                group,
                ConfigAttr::QueueThreshold(config.queue_threshold),
            )
            .map_err(|e| NflogError::open("set queue threshold", e))?;

            if let Some(cs) = config.flush_timeout_cs {
                self.request(unspec, group, ConfigAttr::Timeout(cs))
                    .map_err(|e| NflogError::open("set flush timeout", e))?;
            }

            if let Some(bytes) = config.netlink_buffer_bytes {
                self.request(unspec, group, ConfigAttr::NetlinkBufferSize(bytes))
                    .map_err(|e| NflogError::open("set netlink buffer size", e))?;
            }

            let flags = config.sequence.bits();
            if flags != 0 {
                self.request(unspec, group, ConfigAttr::Flags(flags))
                    .map_err(|e| NflogError::open("set logger flags", e))?;
            }

            let fd = self.fd()?;

            if let Some(bytes) = config.socket_buffer_bytes {
                set_receive_buffer(fd, bytes)
                    .map_err(|e| NflogError::open("set socket receive buffer", e))?;
            }

            if config.overflow_mode == OverflowMode::Ignore {
                set_int_option(fd, libc::SOL_NETLINK, libc::NETLINK_NO_ENOBUFS, 1)
                    .map_err(|e| NflogError::open("set NETLINK_NO_ENOBUFS", e))?;
            }

            // Only blocking reads on `raw_fd()` see this; `recv` waits in
            // poll and reads with MSG_DONTWAIT.
            if let Some(timeout) = config.receive_timeout() {
                set_receive_timeout(fd, timeout)
                    .map_err(|e| NflogError::open("set SO_RCVTIMEO", e))?;
            }

            Ok(())
        }

        fn fd(&self) -> io::Result<RawFd> {
            self.socket
                .as_ref()
                .map(AsRawFd::as_raw_fd)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        }

        /// Send one acknowledged config request and wait for its reply
        fn request(&mut self, family: u8, group: u16, attr: ConfigAttr) -> io::Result<()> {
            self.seq = self.seq.wrapping_add(1);
            let seq = self.seq;
            let request = message::config_request(seq, family, group, attr);

            match &self.socket {
                Some(socket) => socket.send(&request, 0)?,
                None => return Err(io::Error::from(io::ErrorKind::NotConnected)),
            };
            trace!(seq, ?attr, "Sent nflog config request");

            let fd = self.fd()?;
            let deadline = Instant::now() + ACK_TIMEOUT;
            let mut buf = Vec::new();

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no acknowledgement for request {seq}"),
                    ));
                }
                if !poll_readable(fd, None, Some(remaining))?.socket {
                    continue;
                }

                match recv_datagram(fd, &mut buf, self.buffer_size) {
                    Ok(n) if n > buf.len() => {
                        warn!(len = n, "Dropping truncated datagram while configuring");
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) if is_transient(&e) => continue,
                    Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                        warn!("Kernel dropped nflog messages while configuring");
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                match message::find_ack(&buf, seq) {
                    Ok(Some(Ok(()))) => return Ok(()),
                    Ok(Some(Err(errno))) => return Err(io::Error::from_raw_os_error(errno)),
                    Ok(None) => self.backlog.push_back(std::mem::take(&mut buf)),
                    Err(e) => warn!(error = %e, "Discarding malformed datagram while configuring"),
                }
            }
        }
    }

    impl Transport for NetlinkTransport {
        fn recv(
            &mut self,
            buf: &mut Vec<u8>,
            timeout: Option<Duration>,
            cancel: &Canceller,
        ) -> io::Result<RecvEvent> {
            if let Some(datagram) = self.backlog.pop_front() {
                *buf = datagram;
                return Ok(RecvEvent::Datagram);
            }
            let Ok(fd) = self.fd() else {
                return Ok(RecvEvent::Closed);
            };

            let wake = cancel.wake_fd();
            let deadline = timeout.map(|t| Instant::now() + t);

            loop {
                if cancel.is_cancelled() {
                    return Ok(RecvEvent::Closed);
                }

                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                let wait = match (remaining, wake) {
                    (remaining, Some(_)) => remaining,
                    (None, None) => Some(CANCEL_POLL_SLICE),
                    (Some(r), None) => Some(r.min(CANCEL_POLL_SLICE)),
                };

                let ready = poll_readable(fd, wake, wait)?;
                if ready.wake || cancel.is_cancelled() {
                    return Ok(RecvEvent::Closed);
                }

                if ready.socket {
                    match recv_datagram(fd, buf, self.buffer_size) {
                        Ok(n) if n > buf.len() => return Ok(RecvEvent::Truncated(n)),
                        Ok(_) => return Ok(RecvEvent::Datagram),
                        Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                            return Ok(RecvEvent::Overflow)
                        }
                        Err(e) if is_transient(&e) => {}
                        Err(e) => return Err(e),
                    }
                }

                if remaining.is_some_and(|r| r.is_zero()) {
                    return Ok(RecvEvent::TimedOut);
                }
            }
        }

        fn close(&mut self) {
            self.backlog.clear();
            // Dropping the socket closes the descriptor.
            if self.socket.take().is_some() {
                debug!("nflog netlink socket closed");
            }
        }

        fn raw_fd(&self) -> Option<RawFd> {
            self.fd().ok()
        }

        fn receive_buffer_size(&self) -> Option<usize> {
            let fd = self.fd().ok()?;
            let size = get_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF).ok()?;
            usize::try_from(size / 2).ok()
        }
    }

    #[derive(Debug, Default)]
    struct Readiness {
        socket: bool,
        wake: bool,
    }

    fn poll_readable(
        fd: RawFd,
        wake: Option<RawFd>,
        timeout: Option<Duration>,
    ) -> io::Result<Readiness> {
        // poll ignores entries with a negative fd
        let mut fds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: wake.unwrap_or(-1),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: fds is a live array of initialized pollfd structs.
        let ret = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        Ok(Readiness {
            socket: fds[0].revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0,
            wake: fds[1].revents & libc::POLLIN != 0,
        })
    }

    fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
        match timeout {
            None => -1,
            Some(t) => libc::c_int::try_from(t.as_micros().div_ceil(1000))
                .unwrap_or(libc::c_int::MAX),
        }
    }

    /// Receive one datagram without blocking
    ///
    /// Returns the length reported by the kernel, which exceeds `buf.len()`
    /// when the datagram was truncated.
    fn recv_datagram(fd: RawFd, buf: &mut Vec<u8>, capacity: usize) -> io::Result<usize> {
        buf.resize(capacity, 0);
        // SAFETY: buf owns `capacity` initialized bytes.
        let n = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
            )
        };
        if n < 0 {
            buf.clear();
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        buf.truncate(n.min(capacity));
        Ok(n)
    }

    fn is_transient(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }

    fn set_option<T>(
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: &T,
    ) -> io::Result<()> {
        // SAFETY: value points to a live T of the advertised size.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                (value as *const T).cast::<libc::c_void>(),
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_int_option(
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        set_option(fd, level, name, &value)
    }

    fn get_int_option(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: value and len are live locals of the advertised size.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                level,
                name,
                (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    /// `SO_RCVBUFFORCE`, or `SO_RCVBUF` when not privileged
    ///
    /// The unprivileged path is capped by `net.core.rmem_max`; the result is
    /// read back and rejected when the kernel granted less than requested.
    fn set_receive_buffer(fd: RawFd, bytes: u32) -> io::Result<()> {
        let value = libc::c_int::try_from(bytes)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        match set_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUFFORCE, value) {
            Ok(()) => {
                debug!(bytes, "Set socket receive buffer (forced)");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                debug!("SO_RCVBUFFORCE not permitted, falling back to SO_RCVBUF");
                set_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, value)?;
                let granted = get_int_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF)?;
                // The kernel doubles the requested value for bookkeeping.
                if i64::from(granted) < 2 * i64::from(value) {
                    return Err(io::Error::other(format!(
                        "receive buffer limited to {} bytes, {} requested (net.core.rmem_max)",
                        granted / 2,
                        value
                    )));
                }
                debug!(bytes, "Set socket receive buffer");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_receive_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        set_option(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)
    }

}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use super::{Canceller, RecvEvent, Transport};
    use crate::config::SocketConfig;
    use crate::error::{NflogError, Result};
    use std::io;
    use std::time::Duration;

    /// nfnetlink_log exists only on Linux
    pub struct NetlinkTransport {
        _private: (),
    }

    impl NetlinkTransport {
        pub fn open(_config: &SocketConfig) -> Result<Self> {
            Err(NflogError::open(
                "create netlink socket",
                io::Error::new(io::ErrorKind::Unsupported, "nfnetlink_log requires Linux"),
            ))
        }
    }

    impl Transport for NetlinkTransport {
        fn recv(
            &mut self,
            _buf: &mut Vec<u8>,
            _timeout: Option<Duration>,
            _cancel: &Canceller,
        ) -> io::Result<RecvEvent> {
            Ok(RecvEvent::Closed)
        }

        fn close(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_canceller_wait_times_out() {
        let cancel = Canceller::new();
        let start = Instant::now();
        assert!(!cancel.wait(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_canceller_wakes_waiter() {
        let cancel = Canceller::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || remote.wait(None));
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(handle.join().unwrap());
        assert!(cancel.is_cancelled());
        // A second cancel is a no-op.
        cancel.cancel();
    }

    #[test]
    fn test_replay_script_order() {
        let cancel = Canceller::new();
        let mut replay = ReplayTransport::new();
        replay
            .push_datagram(vec![1, 2, 3])
            .push_overflow()
            .push_silence();
        assert_eq!(replay.remaining(), 3);

        let mut buf = Vec::new();
        let timeout = Some(Duration::from_millis(5));
        assert_eq!(
            replay.recv(&mut buf, timeout, &cancel).unwrap(),
            RecvEvent::Datagram
        );
        assert_eq!(buf, vec![1, 2, 3]);
        assert_eq!(
            replay.recv(&mut buf, timeout, &cancel).unwrap(),
            RecvEvent::Overflow
        );
        assert_eq!(
            replay.recv(&mut buf, timeout, &cancel).unwrap(),
            RecvEvent::TimedOut
        );
        assert_eq!(
            replay.recv(&mut buf, timeout, &cancel).unwrap(),
            RecvEvent::Closed
        );
    }

    #[test]
    fn test_replay_close_discards_script() {
        let cancel = Canceller::new();
        let mut replay = ReplayTransport::new();
        replay.push_datagram(vec![0; 4]);
        replay.close();
        assert!(replay.is_closed());
        assert_eq!(replay.remaining(), 0);
        let mut buf = Vec::new();
        assert_eq!(
            replay.recv(&mut buf, None, &cancel).unwrap(),
            RecvEvent::Closed
        );
    }

    #[test]
    fn test_replay_silence_interrupted_by_cancel() {
        let cancel = Canceller::new();
        let mut replay = ReplayTransport::new();
        replay.push_silence();

        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            let mut buf = Vec::new();
            replay.recv(&mut buf, None, &remote).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), RecvEvent::Closed);
    }
}
