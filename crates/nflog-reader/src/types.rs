//! Core types for decoded nflog records
//!
//! The attribute container is indexed by the `nfulnl_attr_type` value itself,
//! so slot `i` always holds attribute type `i` regardless of the order in
//! which the kernel packed the attributes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest attribute type known to this crate (`NFULA_L2HDR`)
pub const NFULA_MAX: u16 = 21;

/// Number of fixed slots in an [`AttributeSet`] (types `0..=NFULA_MAX`)
pub const ATTR_SLOTS: usize = NFULA_MAX as usize + 1;

/// Kernel logging group a socket binds to
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogGroup(pub u16);

impl LogGroup {
    pub fn id(self) -> u16 {
        self.0
    }
}

impl From<u16> for LogGroup {
    fn from(group: u16) -> Self {
        Self(group)
    }
}

impl fmt::Display for LogGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do when the kernel reports that log messages were dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Discard the event; no count is kept
    Ignore,
    /// Count the event and keep receiving
    #[default]
    Handle,
    /// Return [`crate::NflogError::Overflow`] to the caller
    Raise,
}

impl std::str::FromStr for OverflowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" | "disable" => Ok(Self::Ignore),
            "handle" => Ok(Self::Handle),
            "raise" => Ok(Self::Raise),
            other => Err(format!(
                "unknown overflow mode '{other}' (expected ignore, handle or raise)"
            )),
        }
    }
}

/// How much of each packet the kernel copies into the log message
/// (`NFULNL_COPY_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CopyMode {
    None = 0x00,
    Meta = 0x01,
    #[default]
    Packet = 0x02,
}

/// Attribute types of an nflog packet message (`enum nfulnl_attr_type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AttrType {
    Unspec = 0,
    PacketHdr = 1,
    Mark = 2,
    Timestamp = 3,
    IfindexIndev = 4,
    IfindexOutdev = 5,
    IfindexPhysindev = 6,
    IfindexPhysoutdev = 7,
    HwAddr = 8,
    Payload = 9,
    Prefix = 10,
    Uid = 11,
    Seq = 12,
    SeqGlobal = 13,
    Gid = 14,
    HwType = 15,
    HwHeader = 16,
    HwLen = 17,
    Ct = 18,
    CtInfo = 19,
    Vlan = 20,
    L2Hdr = 21,
}

impl AttrType {
    pub const ALL: [AttrType; ATTR_SLOTS] = [
        Self::Unspec,
        Self::PacketHdr,
        Self::Mark,
        Self::Timestamp,
        Self::IfindexIndev,
        Self::IfindexOutdev,
        Self::IfindexPhysindev,
        Self::IfindexPhysoutdev,
        Self::HwAddr,
        Self::Payload,
        Self::Prefix,
        Self::Uid,
        Self::Seq,
        Self::SeqGlobal,
        Self::Gid,
        Self::HwType,
        Self::HwHeader,
        Self::HwLen,
        Self::Ct,
        Self::CtInfo,
        Self::Vlan,
        Self::L2Hdr,
    ];

    /// Create from a wire type value, if it is a known one
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Kernel spelling without the `NFULA_` prefix
    pub fn name(self) -> &'static str {
        match self {
            Self::Unspec => "UNSPEC",
            Self::PacketHdr => "PACKET_HDR",
            Self::Mark => "MARK",
            Self::Timestamp => "TIMESTAMP",
            Self::IfindexIndev => "IFINDEX_INDEV",
            Self::IfindexOutdev => "IFINDEX_OUTDEV",
            Self::IfindexPhysindev => "IFINDEX_PHYSINDEV",
            Self::IfindexPhysoutdev => "IFINDEX_PHYSOUTDEV",
            Self::HwAddr => "HWADDR",
            Self::Payload => "PAYLOAD",
            Self::Prefix => "PREFIX",
            Self::Uid => "UID",
            Self::Seq => "SEQ",
            Self::SeqGlobal => "SEQ_GLOBAL",
            Self::Gid => "GID",
            Self::HwType => "HWTYPE",
            Self::HwHeader => "HWHEADER",
            Self::HwLen => "HWLEN",
            Self::Ct => "CT",
            Self::CtInfo => "CT_INFO",
            Self::Vlan => "VLAN",
            Self::L2Hdr => "L2HDR",
        }
    }
}

/// Attribute payloads of one log message, addressed by attribute type
///
/// Types `0..=NFULA_MAX` live in fixed slots. Types above `NFULA_MAX` (sent
/// by a newer kernel) are kept in `unknown`, sorted by type, so they are
/// never lost. A present attribute with an empty payload is
/// `Some(&[])`, which is different from an absent one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    slots: [Option<Vec<u8>>; ATTR_SLOTS],
    unknown: Vec<(u16, Vec<u8>)>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload of attribute type `index`, known or unknown
    pub fn get(&self, index: u16) -> Option<&[u8]> {
        match self.slots.get(index as usize) {
            Some(slot) => slot.as_deref(),
            None => self
                .unknown
                .binary_search_by_key(&index, |(t, _)| *t)
                .ok()
                .map(|pos| self.unknown[pos].1.as_slice()),
        }
    }

    /// Payload of a known attribute type
    pub fn attr(&self, attr: AttrType) -> Option<&[u8]> {
        self.slots[attr as usize].as_deref()
    }

    /// Store a payload at `index`, returning the one it replaced
    pub fn set(&mut self, index: u16, payload: Vec<u8>) -> Option<Vec<u8>> {
        match self.slots.get_mut(index as usize) {
            Some(slot) => slot.replace(payload),
            None => match self.unknown.binary_search_by_key(&index, |(t, _)| *t) {
                Ok(pos) => Some(std::mem::replace(&mut self.unknown[pos].1, payload)),
                Err(pos) => {
                    self.unknown.insert(pos, (index, payload));
                    None
                }
            },
        }
    }

    /// Builder-style [`AttributeSet::set`]
    pub fn with(mut self, index: u16, payload: impl Into<Vec<u8>>) -> Self {
        self.set(index, payload.into());
        self
    }

    pub fn contains(&self, index: u16) -> bool {
        self.get(index).is_some()
    }

    /// The fixed slots, index == attribute type
    pub fn slots(&self) -> &[Option<Vec<u8>>; ATTR_SLOTS] {
        &self.slots
    }

    /// Attributes with types above [`NFULA_MAX`], sorted by type
    pub fn unknown(&self) -> &[(u16, Vec<u8>)] {
        &self.unknown
    }

    /// Present attributes in ascending type order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_deref().map(|v| (i as u16, v)))
            .chain(self.unknown.iter().map(|(t, v)| (*t, v.as_slice())))
    }

    /// Number of present attributes
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count() + self.unknown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One logged packet: the verdict from the message sub-header plus its attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    verdict: u8,
    attributes: AttributeSet,
}

impl PacketRecord {
    pub fn new(verdict: u8, attributes: AttributeSet) -> Self {
        Self {
            verdict,
            attributes,
        }
    }

    pub fn verdict(&self) -> u8 {
        self.verdict
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    pub fn into_parts(self) -> (u8, AttributeSet) {
        (self.verdict, self.attributes)
    }
}

/// Records decoded from one receive call, in kernel delivery order
pub type Batch = Vec<PacketRecord>;
