//! Netlink message framing for nfnetlink_log
//!
//! A receive buffer holds one or more concatenated netlink messages. Each is
//! split by its own length field, classified, and log data messages are
//! turned into [`PacketRecord`]s. The same module builds the outgoing
//! `NFULNL_MSG_CONFIG` requests used while opening a socket, and encodes
//! records back to wire form for replay.

use crate::attr::{align4, decode_attributes, encode_attributes, push_attribute};
use crate::error::{NflogError, Result};
use crate::types::{Batch, CopyMode, PacketRecord};
use tracing::{debug, trace};

/// Size of `struct nlmsghdr`
pub const NLMSG_HDRLEN: usize = 16;

/// Size of `struct nfgenmsg`
pub const NFGENMSG_LEN: usize = 4;

pub const NLMSG_NOOP: u16 = 0x1;
pub const NLMSG_ERROR: u16 = 0x2;
pub const NLMSG_DONE: u16 = 0x3;
pub const NLMSG_OVERRUN: u16 = 0x4;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;

pub const NFNL_SUBSYS_ULOG: u16 = 4;
pub const NFULNL_MSG_PACKET: u16 = 0;
pub const NFULNL_MSG_CONFIG: u16 = 1;
pub const NFNETLINK_V0: u8 = 0;

/// Message type of a log data message
pub const NFULNL_PACKET_TYPE: u16 = (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_PACKET;

/// Message type of a logger configuration request
pub const NFULNL_CONFIG_TYPE: u16 = (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_CONFIG;

const NFULA_CFG_CMD: u16 = 1;
const NFULA_CFG_MODE: u16 = 2;
const NFULA_CFG_NLBUFSIZ: u16 = 3;
const NFULA_CFG_TIMEOUT: u16 = 4;
const NFULA_CFG_QTHRESH: u16 = 5;
const NFULA_CFG_FLAGS: u16 = 6;

/// `NFULNL_CFG_F_*` flags
pub const NFULNL_CFG_F_SEQ: u16 = 0x0001;
pub const NFULNL_CFG_F_SEQ_GLOBAL: u16 = 0x0002;
pub const NFULNL_CFG_F_CONNTRACK: u16 = 0x0004;

/// Fixed netlink message header, fields in host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMsgHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHeader {
    /// Read a header from the start of `buf`
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let hdr = buf.get(..NLMSG_HDRLEN)?;
        Some(Self {
            len: u32::from_ne_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]),
            msg_type: u16::from_ne_bytes([hdr[4], hdr[5]]),
            flags: u16::from_ne_bytes([hdr[6], hdr[7]]),
            seq: u32::from_ne_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]),
            pid: u32::from_ne_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]),
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.len.to_ne_bytes());
        buf.extend_from_slice(&self.msg_type.to_ne_bytes());
        buf.extend_from_slice(&self.flags.to_ne_bytes());
        buf.extend_from_slice(&self.seq.to_ne_bytes());
        buf.extend_from_slice(&self.pid.to_ne_bytes());
    }
}

/// One netlink message after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkMessage<'a> {
    /// nflog packet message: verdict byte from the sub-header plus the raw
    /// attribute region
    Packet {
        verdict: u8,
        res_id: u16,
        attributes: &'a [u8],
    },
    /// The kernel dropped messages (`NLMSG_OVERRUN` or `-ENOBUFS`)
    Overflow,
    /// Acknowledgement of a request (`NLMSG_ERROR` with error 0)
    Ack { seq: u32 },
    /// Request failed with a positive errno
    Error { seq: u32, errno: i32 },
    /// `NLMSG_NOOP`, `NLMSG_DONE`
    Control(u16),
    /// Anything else (other nfnetlink subsystems, config echoes)
    Other(u16),
}

/// Split `buf` into `(offset, header, body)` triples
///
/// `body` excludes the 16-byte header. Messages advance by their aligned
/// length; the final message's padding may be cut short.
pub fn split_messages(buf: &[u8]) -> Result<Vec<(usize, NlMsgHeader, &[u8])>> {
    match split_prefix(buf) {
        (messages, None) => Ok(messages),
        (_, Some(err)) => Err(err),
    }
}

/// Messages framed before the first bad header, plus that header's error
fn split_prefix(buf: &[u8]) -> (Vec<(usize, NlMsgHeader, &[u8])>, Option<NflogError>) {
    let mut messages = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let rest = &buf[offset..];
        let Some(header) = NlMsgHeader::parse(rest) else {
            let err = NflogError::MalformedMessage {
                offset,
                reason: format!("{} bytes cannot hold a netlink header", rest.len()),
            };
            return (messages, Some(err));
        };

        let len = header.len as usize;
        if len < NLMSG_HDRLEN {
            let err = NflogError::MalformedMessage {
                offset,
                reason: format!("length {len} is shorter than the header"),
            };
            return (messages, Some(err));
        }
        if len > rest.len() {
            let err = NflogError::MalformedMessage {
                offset,
                reason: format!("length {len} exceeds the {} remaining bytes", rest.len()),
            };
            return (messages, Some(err));
        }

        messages.push((offset, header, &rest[NLMSG_HDRLEN..len]));
        offset = offset.saturating_add(align4(len)).min(buf.len());
    }

    (messages, None)
}

/// Classify one message without decoding its attributes
pub fn classify<'a>(
    offset: usize,
    header: &NlMsgHeader,
    body: &'a [u8],
) -> Result<NetlinkMessage<'a>> {
    match header.msg_type {
        NLMSG_NOOP | NLMSG_DONE => Ok(NetlinkMessage::Control(header.msg_type)),
        NLMSG_OVERRUN => Ok(NetlinkMessage::Overflow),
        NLMSG_ERROR => {
            let raw = body.get(..4).ok_or_else(|| NflogError::MalformedMessage {
                offset,
                reason: "error message without an error code".to_string(),
            })?;
            let error = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
            Ok(match error {
                0 => NetlinkMessage::Ack { seq: header.seq },
                e if e == -libc::ENOBUFS => NetlinkMessage::Overflow,
                e => NetlinkMessage::Error {
                    seq: header.seq,
                    errno: e.saturating_neg(),
                },
            })
        }
        NFULNL_PACKET_TYPE => {
            if body.len() < NFGENMSG_LEN {
                return Err(NflogError::MalformedMessage {
                    offset,
                    reason: format!(
                        "log message body of {} bytes is shorter than the nfgenmsg header",
                        body.len()
                    ),
                });
            }
            Ok(NetlinkMessage::Packet {
                verdict: body[0],
                res_id: u16::from_be_bytes([body[2], body[3]]),
                attributes: &body[NFGENMSG_LEN..],
            })
        }
        other => Ok(NetlinkMessage::Other(other)),
    }
}

/// Records decoded from one receive buffer together with the overflow
/// markers seen in it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assembly {
    pub records: Batch,
    pub overflows: usize,
}

/// Receive buffer after classification, before any attribute is decoded
///
/// `overflows` counts every overflow marker in a well-framed message, even
/// ones that follow a malformed message or a kernel error.
#[derive(Debug)]
pub struct Scan<'a> {
    pub overflows: usize,
    /// `(attribute offset, verdict, attribute region)` of each log message
    packets: Vec<(usize, u8, &'a [u8])>,
    /// First violation; log messages after it are not kept
    failure: Option<NflogError>,
}

impl Scan<'_> {
    /// Decode the log messages, failing on the first violation in the buffer
    pub fn decode(self) -> Result<Batch> {
        let records = self
            .packets
            .into_iter()
            .map(|(base, verdict, attributes)| {
                let attrs = decode_attributes(attributes).map_err(|e| rebase(e, base))?;
                Ok(PacketRecord::new(verdict, attrs))
            })
            .collect::<Result<Batch>>()?;

        match self.failure {
            Some(err) => Err(err),
            None => Ok(records),
        }
    }
}

/// Classify every message in `buf` and count overflow markers
pub fn scan_batch(buf: &[u8]) -> Scan<'_> {
    let (messages, split_error) = split_prefix(buf);
    let mut scan = Scan {
        overflows: 0,
        packets: Vec::new(),
        failure: None,
    };

    for (offset, header, body) in messages {
        let message = match classify(offset, &header, body) {
            Ok(message) => message,
            Err(err) => {
                scan.failure.get_or_insert(err);
                continue;
            }
        };

        match message {
            NetlinkMessage::Packet {
                verdict,
                attributes,
                ..
            } => {
                if scan.failure.is_none() {
                    let base = offset + NLMSG_HDRLEN + NFGENMSG_LEN;
                    scan.packets.push((base, verdict, attributes));
                }
            }
            NetlinkMessage::Overflow => {
                debug!(offset, "Overflow marker in receive buffer");
                scan.overflows += 1;
            }
            NetlinkMessage::Error { errno, seq } => {
                debug!(errno, seq, "Kernel error in receive buffer");
                scan.failure.get_or_insert(NflogError::Kernel { errno });
            }
            NetlinkMessage::Ack { seq } => trace!(seq, "Skipping acknowledgement"),
            NetlinkMessage::Control(msg_type) => trace!(msg_type, "Skipping control message"),
            NetlinkMessage::Other(msg_type) => {
                debug!(msg_type, offset, "Skipping unexpected netlink message type")
            }
        }
    }

    if let Some(err) = split_error {
        scan.failure.get_or_insert(err);
    }
    scan
}

/// Decode a whole receive buffer into records
///
/// Either every message is well formed and the full batch is returned, or
/// the first violation fails the entire buffer. A kernel error (other than
/// `ENOBUFS`) fails the buffer as [`NflogError::Kernel`].
pub fn assemble_batch(buf: &[u8]) -> Result<Assembly> {
    let scan = scan_batch(buf);
    let overflows = scan.overflows;
    Ok(Assembly {
        records: scan.decode()?,
        overflows,
    })
}

/// Decode a single netlink log message into a record
pub fn decode_record(msg: &[u8]) -> Result<PacketRecord> {
    let messages = split_messages(msg)?;
    let (offset, header, body) =
        messages
            .into_iter()
            .next()
            .ok_or_else(|| NflogError::MalformedMessage {
                offset: 0,
                reason: "empty buffer".to_string(),
            })?;

    match classify(offset, &header, body)? {
        NetlinkMessage::Packet {
            verdict,
            attributes,
            ..
        } => {
            let attrs = decode_attributes(attributes)
                .map_err(|e| rebase(e, NLMSG_HDRLEN + NFGENMSG_LEN))?;
            Ok(PacketRecord::new(verdict, attrs))
        }
        _ => Err(NflogError::MalformedMessage {
            offset,
            reason: format!("message type {:#06x} is not a log message", header.msg_type),
        }),
    }
}

/// Look for the acknowledgement of request `seq` in a receive buffer
///
/// Returns `None` when the buffer holds no reply for `seq`.
pub fn find_ack(buf: &[u8], seq: u32) -> Result<Option<std::result::Result<(), i32>>> {
    for (offset, header, body) in split_messages(buf)? {
        match classify(offset, &header, body)? {
            NetlinkMessage::Ack { seq: s } if s == seq => return Ok(Some(Ok(()))),
            NetlinkMessage::Error { seq: s, errno } if s == seq => return Ok(Some(Err(errno))),
            _ => {}
        }
    }
    Ok(None)
}

fn rebase(err: NflogError, base: usize) -> NflogError {
    match err {
        NflogError::MalformedAttribute { offset, reason } => NflogError::MalformedAttribute {
            offset: base + offset,
            reason,
        },
        other => other,
    }
}

/// Logger commands carried by `NFULA_CFG_CMD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigCommand {
    None = 0,
    Bind = 1,
    Unbind = 2,
    PfBind = 3,
    PfUnbind = 4,
}

/// One configuration attribute of an `NFULNL_MSG_CONFIG` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAttr {
    Command(ConfigCommand),
    Mode { copy_mode: CopyMode, copy_range: u32 },
    NetlinkBufferSize(u32),
    /// Flush timeout in 1/100 s
    Timeout(u32),
    QueueThreshold(u32),
    Flags(u16),
}

impl ConfigAttr {
    fn attr_type(&self) -> u16 {
        match self {
            Self::Command(_) => NFULA_CFG_CMD,
            Self::Mode { .. } => NFULA_CFG_MODE,
            Self::NetlinkBufferSize(_) => NFULA_CFG_NLBUFSIZ,
            Self::Timeout(_) => NFULA_CFG_TIMEOUT,
            Self::QueueThreshold(_) => NFULA_CFG_QTHRESH,
            Self::Flags(_) => NFULA_CFG_FLAGS,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match *self {
            Self::Command(cmd) => vec![cmd as u8],
            Self::Mode {
                copy_mode,
                copy_range,
            } => {
                let mut p = copy_range.to_be_bytes().to_vec();
                p.push(copy_mode as u8);
                p.push(0);
                p
            }
            Self::NetlinkBufferSize(v) | Self::Timeout(v) | Self::QueueThreshold(v) => {
                v.to_be_bytes().to_vec()
            }
            Self::Flags(f) => f.to_be_bytes().to_vec(),
        }
    }
}

/// Build an acknowledged `NFULNL_MSG_CONFIG` request
pub fn config_request(seq: u32, family: u8, group: u16, attr: ConfigAttr) -> Vec<u8> {
    let mut body = vec![family, NFNETLINK_V0];
    body.extend_from_slice(&group.to_be_bytes());
    push_attribute(&mut body, attr.attr_type(), &attr.payload());
    frame(NFULNL_CONFIG_TYPE, NLM_F_REQUEST | NLM_F_ACK, seq, &body)
}

/// Encode a record as an nflog packet message
pub fn encode_record(record: &PacketRecord, seq: u32) -> Vec<u8> {
    let mut body = vec![record.verdict(), NFNETLINK_V0, 0, 0];
    body.extend(encode_attributes(record.attributes()));
    frame(NFULNL_PACKET_TYPE, 0, seq, &body)
}

/// Encode a batch as one datagram of concatenated packet messages
pub fn encode_batch(batch: &Batch) -> Vec<u8> {
    batch
        .iter()
        .zip(0u32..)
        .flat_map(|(record, seq)| encode_record(record, seq))
        .collect()
}

/// `NLMSG_OVERRUN` marker, as some kernels report dropped messages
pub fn encode_overrun(seq: u32) -> Vec<u8> {
    frame(NLMSG_OVERRUN, 0, seq, &[])
}

/// `NLMSG_ERROR` carrying `-errno` (0 for an acknowledgement)
pub fn encode_error(errno: i32, seq: u32) -> Vec<u8> {
    let mut body = errno.saturating_neg().to_ne_bytes().to_vec();
    NlMsgHeader {
        len: NLMSG_HDRLEN as u32,
        msg_type: 0,
        flags: 0,
        seq,
        pid: 0,
    }
    .write(&mut body);
    frame(NLMSG_ERROR, 0, seq, &body)
}

fn frame(msg_type: u16, flags: u16, seq: u32, body: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + body.len();
    let mut buf = Vec::with_capacity(align4(len));
    NlMsgHeader {
        len: len as u32,
        msg_type,
        flags,
        seq,
        pid: 0,
    }
    .write(&mut buf);
    buf.extend_from_slice(body);
    buf.resize(align4(len), 0);
    buf
}
