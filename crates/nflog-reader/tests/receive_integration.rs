//! Integration tests for the receive path
//!
//! Datagrams are built byte by byte here and fed through the replay
//! transport, so the socket manager, overflow policy, assembler and
//! attribute decoder run exactly as they do against the kernel.

#[cfg(test)]
mod tests {
    use nflog_reader::message::decode_record;
    use nflog_reader::{
        AttrType, NflogError, NflogSocket, OverflowMode, OverflowState, ReplayTransport,
        SocketConfig, NFULA_MAX,
    };
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::{Duration, Instant};

    const NFULNL_PACKET_TYPE: u16 = 0x0400;
    const NLMSG_ERROR: u16 = 0x2;
    const NLMSG_OVERRUN: u16 = 0x4;

    fn nlattr(attr_type: u16, payload: &[u8]) -> Vec<u8> {
        let len = 4 + payload.len();
        let mut buf = Vec::with_capacity(len + 3);
        buf.extend_from_slice(&(len as u16).to_ne_bytes());
        buf.extend_from_slice(&attr_type.to_ne_bytes());
        buf.extend_from_slice(payload);
        buf.resize((len + 3) & !3, 0);
        buf
    }

    fn nlmsg(msg_type: u16, body: &[u8]) -> Vec<u8> {
        let len = 16 + body.len();
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&(len as u32).to_ne_bytes());
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(body);
        buf
    }

    /// nflog packet message: nfgenmsg{verdict, v0, res_id 0} + attributes
    fn packet_message(verdict: u8, attrs: &[u8]) -> Vec<u8> {
        let mut body = vec![verdict, 0, 0, 0];
        body.extend_from_slice(attrs);
        nlmsg(NFULNL_PACKET_TYPE, &body)
    }

    fn error_message(errno: i32) -> Vec<u8> {
        let mut body = (-errno).to_ne_bytes().to_vec();
        body.extend_from_slice(&[0; 16]);
        nlmsg(NLMSG_ERROR, &body)
    }

    fn config(mode: OverflowMode) -> SocketConfig {
        SocketConfig::new(0)
            .with_queue_threshold(1)
            .with_receive_timeout(Duration::from_millis(100))
            .with_overflow_mode(mode)
    }

    #[test]
    fn test_single_record_at_index_6() {
        let payload: Vec<u8> = (0..10).collect();
        let mut transport = ReplayTransport::new();
        transport.push_datagram(packet_message(1, &nlattr(6, &payload)));

        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();
        let batch = socket.receive().unwrap();

        assert_eq!(batch.len(), 1);
        let record = &batch[0];
        assert_eq!(record.verdict(), 1);
        assert_eq!(record.attributes().get(6), Some(&payload[..]));
        for index in (0..=NFULA_MAX).filter(|&i| i != 6) {
            assert_eq!(record.attributes().get(index), None, "index {index}");
        }
        assert!(record.attributes().unknown().is_empty());
    }

    #[test]
    fn test_single_record_in_payload_slot() {
        let payload = b"0123456789";
        let mut attrs = nlattr(AttrType::PacketHdr as u16, &[0x08, 0x00, 1, 0]);
        attrs.extend(nlattr(AttrType::Payload as u16, payload));
        attrs.extend(nlattr(AttrType::Prefix as u16, b"INPUT DROP\0"));

        let mut transport = ReplayTransport::new();
        transport.push_datagram(packet_message(1, &attrs));
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        let batch = socket.receive().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), Some(&payload[..]));
        assert_eq!(batch[0].hw_protocol(), Some(0x0800));
        assert_eq!(batch[0].prefix().as_deref(), Some("INPUT DROP"));
        assert_eq!(batch[0].attributes().len(), 3);
    }

    #[test]
    fn test_two_messages_in_one_datagram() {
        let first = packet_message(0, &nlattr(AttrType::Mark as u16, &1u32.to_be_bytes()));
        let second = packet_message(1, &nlattr(AttrType::Payload as u16, b"xyz"));
        let mut datagram = first.clone();
        datagram.extend_from_slice(&second);

        let mut transport = ReplayTransport::new();
        transport.push_datagram(datagram);
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        let batch = socket.receive().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], decode_record(&first).unwrap());
        assert_eq!(batch[1], decode_record(&second).unwrap());
        assert_eq!(batch[0].mark(), Some(1));
        assert_eq!(batch[1].payload(), Some(&b"xyz"[..]));
    }

    #[test]
    fn test_overflow_ignore_continues_silently() {
        let mut transport = ReplayTransport::new();
        transport
            .push_overflow()
            .push_datagram(packet_message(1, &nlattr(AttrType::Payload as u16, b"ok")));

        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Ignore), transport).unwrap();
        let batch = socket.receive().unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), Some(&b"ok"[..]));
        assert_eq!(socket.drops(), None);
    }

    #[test]
    fn test_overflow_handle_counts() {
        let mut transport = ReplayTransport::new();
        transport
            .push_overflow()
            .push_datagram(nlmsg(NLMSG_OVERRUN, &[]))
            .push_datagram(error_message(libc::ENOBUFS))
            .push_datagram(packet_message(1, &nlattr(AttrType::Payload as u16, b"ok")));

        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();
        let batch = socket.receive().unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(socket.drops(), Some(3));
        assert_eq!(socket.overflow_state(), OverflowState::Normal);

        socket.reset_drops();
        assert_eq!(socket.drops(), Some(0));
    }

    #[test]
    fn test_overflow_raise_then_recovers() {
        let mut transport = ReplayTransport::new();
        transport
            .push_overflow()
            .push_datagram(packet_message(1, &nlattr(AttrType::Payload as u16, b"ok")));

        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Raise), transport).unwrap();

        assert!(matches!(socket.receive(), Err(NflogError::Overflow)));
        assert_eq!(socket.overflow_state(), OverflowState::Overflowed);
        assert!(!socket.is_closed());

        let batch = socket.receive().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(socket.overflow_state(), OverflowState::Normal);
        assert_eq!(socket.drops(), None);
    }

    #[test]
    fn test_overflow_raise_keeps_records_from_same_datagram() {
        let mut datagram = nlmsg(NLMSG_OVERRUN, &[]);
        datagram.extend(packet_message(2, &nlattr(AttrType::Payload as u16, b"kept")));

        let mut transport = ReplayTransport::new();
        transport.push_datagram(datagram);
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Raise), transport).unwrap();

        assert!(matches!(socket.receive(), Err(NflogError::Overflow)));
        let batch = socket.receive().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].verdict(), 2);
        assert_eq!(batch[0].payload(), Some(&b"kept"[..]));
    }

    #[test]
    fn test_timeout_returns_empty_batch() {
        let mut transport = ReplayTransport::new();
        transport.push_silence();
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        let start = Instant::now();
        let batch = socket.receive().unwrap();
        let elapsed = start.elapsed();

        assert!(batch.is_empty());
        assert!(elapsed >= Duration::from_millis(80), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
        assert!(!socket.is_closed());
    }

    #[test]
    fn test_close_twice_then_receive() {
        let mut transport = ReplayTransport::new();
        transport.push_datagram(packet_message(1, &[]));
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        socket.close();
        socket.close();
        assert!(socket.is_closed());
        assert!(matches!(socket.receive(), Err(NflogError::Closed)));
    }

    #[test]
    fn test_cancel_wakes_blocked_receive() {
        let mut transport = ReplayTransport::new();
        transport.push_silence();
        // No receive timeout: only cancellation can end this receive.
        let mut socket = NflogSocket::with_transport(SocketConfig::new(0), transport).unwrap();
        let canceller = socket.canceller();

        let receiver = thread::spawn(move || {
            let result = socket.receive();
            (result, socket.is_closed())
        });

        thread::sleep(Duration::from_millis(50));
        canceller.cancel();

        let (result, closed) = receiver.join().unwrap();
        assert!(matches!(result, Err(NflogError::Closed)));
        assert!(closed);
    }

    #[test]
    fn test_truncated_attribute_fails_batch_only() {
        // Attribute claims 40 bytes but only 8 are present.
        let mut bad_attrs = 40u16.to_ne_bytes().to_vec();
        bad_attrs.extend_from_slice(&(AttrType::Payload as u16).to_ne_bytes());
        bad_attrs.extend_from_slice(&[1, 2, 3, 4]);

        let mut datagram = packet_message(1, &nlattr(AttrType::Mark as u16, &[0; 4]));
        datagram.extend(packet_message(1, &bad_attrs));

        let mut transport = ReplayTransport::new();
        transport
            .push_overflow()
            .push_datagram(datagram)
            .push_datagram(packet_message(0, &nlattr(AttrType::Payload as u16, b"next")));
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        match socket.receive() {
            Err(NflogError::MalformedAttribute { offset, .. }) => {
                // Second message starts at 28; its attributes at 28 + 20.
                assert_eq!(offset, 48);
            }
            other => panic!("expected MalformedAttribute, got {other:?}"),
        }

        let batch = socket.receive().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), Some(&b"next"[..]));
        assert_eq!(socket.drops(), Some(1));
    }

    /// Overrun marker followed by a log message whose attribute claims
    /// 40 bytes but carries 8
    fn overrun_with_truncated_attribute() -> Vec<u8> {
        let mut bad_attrs = 40u16.to_ne_bytes().to_vec();
        bad_attrs.extend_from_slice(&(AttrType::Payload as u16).to_ne_bytes());
        bad_attrs.extend_from_slice(&[1, 2, 3, 4]);

        let mut datagram = nlmsg(NLMSG_OVERRUN, &[]);
        datagram.extend(packet_message(1, &bad_attrs));
        datagram
    }

    #[test]
    fn test_overflow_counted_when_same_datagram_is_malformed() {
        let mut transport = ReplayTransport::new();
        transport
            .push_datagram(overrun_with_truncated_attribute())
            .push_datagram(packet_message(0, &nlattr(AttrType::Payload as u16, b"next")));
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        assert!(matches!(
            socket.receive(),
            Err(NflogError::MalformedAttribute { offset: 36, .. })
        ));
        assert_eq!(socket.drops(), Some(1));
        assert_eq!(socket.overflow_state(), OverflowState::Overflowed);

        let batch = socket.receive().unwrap();
        assert_eq!(batch[0].payload(), Some(&b"next"[..]));
        assert_eq!(socket.overflow_state(), OverflowState::Normal);
        assert_eq!(socket.drops(), Some(1));
    }

    #[test]
    fn test_overflow_raised_when_same_datagram_is_malformed() {
        let mut transport = ReplayTransport::new();
        transport
            .push_datagram(overrun_with_truncated_attribute())
            .push_datagram(packet_message(0, &nlattr(AttrType::Payload as u16, b"next")));
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Raise), transport).unwrap();

        assert!(matches!(socket.receive(), Err(NflogError::Overflow)));
        assert_eq!(socket.overflow_state(), OverflowState::Overflowed);

        // Nothing from the malformed message is held back.
        let batch = socket.receive().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), Some(&b"next"[..]));
        assert_eq!(socket.overflow_state(), OverflowState::Normal);
    }

    #[test]
    fn test_truncated_header_is_malformed_message() {
        let message = packet_message(1, &nlattr(AttrType::Payload as u16, b"abcd"));
        let mut transport = ReplayTransport::new();
        transport.push_datagram(message[..10].to_vec());
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        let err = socket.receive().unwrap_err();
        assert!(matches!(err, NflogError::MalformedMessage { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unknown_attribute_collected() {
        let mut attrs = nlattr(AttrType::Payload as u16, b"p");
        attrs.extend(nlattr(40, b"later"));
        attrs.extend(nlattr(30, b"sooner"));

        let mut transport = ReplayTransport::new();
        transport.push_datagram(packet_message(1, &attrs));
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        let batch = socket.receive().unwrap();
        let record = &batch[0];
        assert_eq!(record.payload(), Some(&b"p"[..]));
        assert_eq!(
            record.attributes().unknown(),
            &[(30, b"sooner".to_vec()), (40, b"later".to_vec())]
        );
        assert_eq!(record.attributes().get(30), Some(&b"sooner"[..]));
    }

    #[test]
    fn test_kernel_error_is_reported() {
        let mut transport = ReplayTransport::new();
        transport.push_datagram(error_message(libc::EPERM));
        let mut socket =
            NflogSocket::with_transport(config(OverflowMode::Handle), transport).unwrap();

        match socket.receive() {
            Err(NflogError::Kernel { errno }) => assert_eq!(errno, libc::EPERM),
            other => panic!("expected Kernel error, got {other:?}"),
        }
    }

    #[test]
    fn test_batches_iterator_ends_on_close() {
        let mut transport = ReplayTransport::new();
        transport
            .push_datagram(packet_message(0, &[]))
            .push_silence()
            .push_datagram(packet_message(1, &[]));
        let mut socket = NflogSocket::with_transport(
            SocketConfig::new(0).with_receive_timeout(Duration::from_millis(10)),
            transport,
        )
        .unwrap();

        let sizes: Vec<usize> = socket.batches().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![1, 0, 1]);
        assert!(socket.is_closed());
    }

    #[test]
    fn test_scoped_closes_on_error() {
        let mut transport = ReplayTransport::new();
        transport.push_datagram(packet_message(0, &[]));

        let result: Result<(), NflogError> =
            NflogSocket::scoped_with(config(OverflowMode::Handle), transport, |socket| {
                assert_eq!(socket.receive()?.len(), 1);
                Err(NflogError::Overflow)
            });
        assert!(matches!(result, Err(NflogError::Overflow)));
    }

    #[test]
    fn test_independent_sockets_keep_separate_state() {
        let mut first = ReplayTransport::new();
        first.push_overflow().push_datagram(packet_message(0, &[]));
        let mut second = ReplayTransport::new();
        second.push_datagram(packet_message(0, &[]));

        let mut a = NflogSocket::with_transport(config(OverflowMode::Handle), first).unwrap();
        let mut b = NflogSocket::with_transport(config(OverflowMode::Handle), second).unwrap();
        a.receive().unwrap();
        b.receive().unwrap();

        assert_eq!(a.drops(), Some(1));
        assert_eq!(b.drops(), Some(0));
    }

    /// Open a real socket, or `None` when unprivileged or without
    /// nfnetlink_log support
    #[cfg(target_os = "linux")]
    fn open_kernel_socket(config: SocketConfig) -> Option<NflogSocket> {
        match NflogSocket::open(config) {
            Ok(socket) => Some(socket),
            Err(NflogError::Open { .. }) => None,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_kernel_socket() {
        let config = SocketConfig::new(0).with_receive_timeout(Duration::from_millis(100));
        let Some(mut socket) = open_kernel_socket(config) else {
            return;
        };
        assert!(socket.raw_fd().is_some());
        assert!(socket.receive_buffer_size().is_some());

        let start = Instant::now();
        let batch = socket.receive().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
        // The group may carry real traffic; an idle one waits out the timeout.
        if batch.is_empty() {
            assert!(elapsed >= Duration::from_millis(80), "returned after {elapsed:?}");
        }
        assert!(!socket.is_closed());

        socket.close();
        assert!(socket.raw_fd().is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cancel_wakes_kernel_receive() {
        // No receive timeout, and a group of its own so it can bind while
        // other tests hold group 0.
        let Some(mut socket) = open_kernel_socket(SocketConfig::new(1)) else {
            return;
        };
        let canceller = socket.canceller();

        let receiver = thread::spawn(move || loop {
            match socket.receive() {
                Ok(_) => continue,
                result => return (result, socket.is_closed()),
            }
        });

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        canceller.cancel();

        let (result, closed) = receiver.join().unwrap();
        assert!(matches!(result, Err(NflogError::Closed)), "got {result:?}");
        assert!(closed);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
