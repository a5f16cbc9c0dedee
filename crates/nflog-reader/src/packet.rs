//! Typed view of a logged packet
//!
//! Accessors read the fixed-layout attributes of a [`PacketRecord`]. They
//! are lenient: an attribute that is absent or too short for its type reads
//! as `None` rather than failing the whole record.
//!
//! [`RecordBuilder`] goes the other way and synthesizes records from typed
//! fields, and [`PacketSummary`] is the serializable form printed by
//! `nflog-dump`.

use crate::attr::decode_attributes;
use crate::types::{AttrType, AttributeSet, PacketRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum hardware address length carried by `NFULA_HWADDR`
pub const HWADDR_MAX: usize = 8;

const NFULA_VLAN_PROTO: u16 = 1;
const NFULA_VLAN_TCI: u16 = 2;

/// 802.1Q tag from `NFULA_VLAN`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanTag {
    pub proto: u16,
    pub tci: u16,
}

impl VlanTag {
    pub fn id(&self) -> u16 {
        self.tci & 0x0fff
    }
}

fn be_u16(bytes: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(bytes.get(..2)?.try_into().ok()?))
}

fn be_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}

fn be_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.get(..8)?.try_into().ok()?))
}

impl PacketRecord {
    fn attr_u32(&self, attr: AttrType) -> Option<u32> {
        self.attributes().attr(attr).and_then(be_u32)
    }

    /// Link-layer protocol (`ETH_P_*`) from the packet header
    pub fn hw_protocol(&self) -> Option<u16> {
        self.attributes().attr(AttrType::PacketHdr).and_then(be_u16)
    }

    /// Netfilter hook the packet was logged from
    pub fn hook(&self) -> Option<u8> {
        self.attributes()
            .attr(AttrType::PacketHdr)
            .and_then(|hdr| hdr.get(2).copied())
    }

    pub fn mark(&self) -> Option<u32> {
        self.attr_u32(AttrType::Mark)
    }

    /// Packet timestamp in microseconds since the epoch
    pub fn timestamp_us(&self) -> Option<u64> {
        let ts = self.attributes().attr(AttrType::Timestamp)?;
        let sec = be_u64(ts)?;
        let usec = be_u64(ts.get(8..)?)?;
        sec.checked_mul(1_000_000)?.checked_add(usec)
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        UNIX_EPOCH.checked_add(Duration::from_micros(self.timestamp_us()?))
    }

    pub fn indev(&self) -> Option<u32> {
        self.attr_u32(AttrType::IfindexIndev)
    }

    pub fn outdev(&self) -> Option<u32> {
        self.attr_u32(AttrType::IfindexOutdev)
    }

    pub fn physindev(&self) -> Option<u32> {
        self.attr_u32(AttrType::IfindexPhysindev)
    }

    pub fn physoutdev(&self) -> Option<u32> {
        self.attr_u32(AttrType::IfindexPhysoutdev)
    }

    /// Source hardware address, trimmed to its advertised length
    pub fn hwaddr(&self) -> Option<&[u8]> {
        let hw = self.attributes().attr(AttrType::HwAddr)?;
        let len = usize::from(be_u16(hw)?).min(HWADDR_MAX);
        hw.get(4..4 + len)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.attributes().attr(AttrType::Payload)
    }

    /// Log prefix, up to the first NUL
    pub fn prefix(&self) -> Option<String> {
        let raw = self.attributes().attr(AttrType::Prefix)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn uid(&self) -> Option<u32> {
        self.attr_u32(AttrType::Uid)
    }

    pub fn gid(&self) -> Option<u32> {
        self.attr_u32(AttrType::Gid)
    }

    /// Per-group sequence number
    pub fn seq(&self) -> Option<u32> {
        self.attr_u32(AttrType::Seq)
    }

    pub fn seq_global(&self) -> Option<u32> {
        self.attr_u32(AttrType::SeqGlobal)
    }

    /// Hardware type (`ARPHRD_*`)
    pub fn hwtype(&self) -> Option<u16> {
        self.attributes().attr(AttrType::HwType).and_then(be_u16)
    }

    pub fn hw_header(&self) -> Option<&[u8]> {
        self.attributes().attr(AttrType::HwHeader)
    }

    pub fn hw_header_len(&self) -> Option<u16> {
        self.attributes().attr(AttrType::HwLen).and_then(be_u16)
    }

    /// Conntrack state (`enum ip_conntrack_info`)
    pub fn ct_info(&self) -> Option<u32> {
        self.attr_u32(AttrType::CtInfo)
    }

    pub fn vlan(&self) -> Option<VlanTag> {
        let nested = decode_attributes(self.attributes().attr(AttrType::Vlan)?).ok()?;
        Some(VlanTag {
            proto: nested.get(NFULA_VLAN_PROTO).and_then(be_u16)?,
            tci: nested.get(NFULA_VLAN_TCI).and_then(be_u16)?,
        })
    }

    pub fn l2_header(&self) -> Option<&[u8]> {
        self.attributes().attr(AttrType::L2Hdr)
    }
}

/// Builds [`PacketRecord`]s from typed fields, in kernel wire layout
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    verdict: u8,
    attrs: AttributeSet,
}

impl RecordBuilder {
    pub fn new(verdict: u8) -> Self {
        Self {
            verdict,
            attrs: AttributeSet::new(),
        }
    }

    fn put(mut self, attr: AttrType, payload: Vec<u8>) -> Self {
        self.attrs.set(attr as u16, payload);
        self
    }

    /// Packet header with protocol and hook
    pub fn packet_hdr(self, hw_protocol: u16, hook: u8) -> Self {
        let mut hdr = hw_protocol.to_be_bytes().to_vec();
        hdr.extend_from_slice(&[hook, 0]);
        self.put(AttrType::PacketHdr, hdr)
    }

    pub fn mark(self, mark: u32) -> Self {
        self.put(AttrType::Mark, mark.to_be_bytes().to_vec())
    }

    pub fn timestamp_us(self, micros: u64) -> Self {
        let mut ts = (micros / 1_000_000).to_be_bytes().to_vec();
        ts.extend_from_slice(&(micros % 1_000_000).to_be_bytes());
        self.put(AttrType::Timestamp, ts)
    }

    pub fn indev(self, ifindex: u32) -> Self {
        self.put(AttrType::IfindexIndev, ifindex.to_be_bytes().to_vec())
    }

    pub fn outdev(self, ifindex: u32) -> Self {
        self.put(AttrType::IfindexOutdev, ifindex.to_be_bytes().to_vec())
    }

    pub fn physindev(self, ifindex: u32) -> Self {
        self.put(AttrType::IfindexPhysindev, ifindex.to_be_bytes().to_vec())
    }

    pub fn physoutdev(self, ifindex: u32) -> Self {
        self.put(AttrType::IfindexPhysoutdev, ifindex.to_be_bytes().to_vec())
    }

    /// Hardware address; anything past [`HWADDR_MAX`] bytes is dropped
    pub fn hwaddr(self, addr: &[u8]) -> Self {
        let len = addr.len().min(HWADDR_MAX);
        let mut hw = (len as u16).to_be_bytes().to_vec();
        hw.extend_from_slice(&[0, 0]);
        hw.extend_from_slice(&addr[..len]);
        hw.resize(4 + HWADDR_MAX, 0);
        self.put(AttrType::HwAddr, hw)
    }

    pub fn payload(self, payload: impl Into<Vec<u8>>) -> Self {
        self.put(AttrType::Payload, payload.into())
    }

    /// Log prefix, NUL-terminated on the wire
    pub fn prefix(self, prefix: &str) -> Self {
        let mut raw = prefix.as_bytes().to_vec();
        raw.push(0);
        self.put(AttrType::Prefix, raw)
    }

    pub fn uid(self, uid: u32) -> Self {
        self.put(AttrType::Uid, uid.to_be_bytes().to_vec())
    }

    pub fn gid(self, gid: u32) -> Self {
        self.put(AttrType::Gid, gid.to_be_bytes().to_vec())
    }

    pub fn hwtype(self, hwtype: u16) -> Self {
        self.put(AttrType::HwType, hwtype.to_be_bytes().to_vec())
    }

    /// Hardware header; also sets `NFULA_HWLEN`
    pub fn hw_header(self, header: &[u8]) -> Self {
        let len = u16::try_from(header.len()).unwrap_or(u16::MAX);
        self.put(AttrType::HwHeader, header.to_vec())
            .put(AttrType::HwLen, len.to_be_bytes().to_vec())
    }

    /// Raw attribute, including types this crate does not know
    pub fn raw(mut self, attr_type: u16, payload: impl Into<Vec<u8>>) -> Self {
        self.attrs.set(attr_type, payload.into());
        self
    }

    pub fn build(self) -> PacketRecord {
        PacketRecord::new(self.verdict, self.attrs)
    }
}

/// Interface index to name resolution with a per-reader cache
///
/// Index 0 means "no device". Unresolvable indexes are named `unkn/<index>`.
/// Names can be preset, which replaces system lookups for those indexes.
#[derive(Debug, Default)]
pub struct InterfaceNames {
    cache: HashMap<u32, String>,
}

impl InterfaceNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached name, without querying the system
    pub fn get(&self, ifindex: u32) -> Option<&str> {
        self.cache.get(&ifindex).map(String::as_str)
    }

    pub fn insert(&mut self, ifindex: u32, name: impl Into<String>) {
        self.cache.insert(ifindex, name.into());
    }

    /// Resolve a device index, querying the system on a cache miss
    pub fn resolve(&mut self, ifindex: u32) -> Option<&str> {
        if ifindex == 0 {
            return None;
        }
        let name = self
            .cache
            .entry(ifindex)
            .or_insert_with(|| system_name(ifindex).unwrap_or_else(|| format!("unkn/{ifindex}")));
        Some(name.as_str())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(target_os = "linux")]
fn system_name(ifindex: u32) -> Option<String> {
    nix::net::if_::if_indextoname(ifindex)
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "linux"))]
fn system_name(_ifindex: u32) -> Option<String> {
    None
}

/// Serializable digest of one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketSummary {
    pub verdict: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_protocol: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outdev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physindev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physoutdev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hwtype: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hwtype_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hwaddr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub payload_len: usize,
}

impl PacketSummary {
    pub fn from_record(record: &PacketRecord, names: &mut InterfaceNames) -> Self {
        let mut dev = |ifindex: Option<u32>| {
            ifindex.and_then(|i| names.resolve(i).map(str::to_string))
        };
        let hw_protocol = record.hw_protocol();
        let hwtype = record.hwtype();

        Self {
            verdict: record.verdict(),
            hw_protocol,
            protocol_name: hw_protocol
                .and_then(nflog_consts::proto_name)
                .map(str::to_string),
            hook: record.hook(),
            mark: record.mark(),
            timestamp_us: record.timestamp_us(),
            indev: dev(record.indev()),
            outdev: dev(record.outdev()),
            physindev: dev(record.physindev()),
            physoutdev: dev(record.physoutdev()),
            uid: record.uid(),
            gid: record.gid(),
            hwtype,
            hwtype_name: hwtype.and_then(nflog_consts::hwtype_name).map(str::to_string),
            hwaddr: record.hwaddr().map(format_hwaddr),
            prefix: record.prefix(),
            payload_len: record.payload().map_or(0, <[u8]>::len),
        }
    }
}

impl std::fmt::Display for PacketSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verdict={}", self.verdict)?;
        if let Some(ts) = self.timestamp_us {
            write!(f, " ts={}.{:06}", ts / 1_000_000, ts % 1_000_000)?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, " prefix={prefix:?}")?;
        }
        match (&self.protocol_name, self.hw_protocol) {
            (Some(name), _) => write!(f, " proto={name}")?,
            (None, Some(proto)) => write!(f, " proto={proto:#06x}")?,
            (None, None) => {}
        }
        for (label, dev) in [
            ("in", &self.indev),
            ("out", &self.outdev),
            ("physin", &self.physindev),
            ("physout", &self.physoutdev),
        ] {
            if let Some(dev) = dev {
                write!(f, " {label}={dev}")?;
            }
        }
        if let Some(mark) = self.mark {
            write!(f, " mark={mark:#x}")?;
        }
        if let Some(hwaddr) = &self.hwaddr {
            write!(f, " hwaddr={hwaddr}")?;
        }
        if let Some(uid) = self.uid {
            write!(f, " uid={uid}")?;
        }
        if let Some(gid) = self.gid {
            write!(f, " gid={gid}")?;
        }
        write!(f, " len={}", self.payload_len)
    }
}

fn format_hwaddr(addr: &[u8]) -> String {
    addr.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
