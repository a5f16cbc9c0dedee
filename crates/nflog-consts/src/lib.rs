//! Constant tables for interpreting nflog attribute values
//!
//! Maps symbolic hardware-type names (`ARPHRD_*` from `net/if_arp.h`) and
//! link-layer protocol names (`ETH_P_*` from `linux/if_ether.h`) to their
//! integer values. The tables here are the embedded fallback used when the
//! host headers are not available at build time; consumers only look values
//! up and never modify them.
//!
//! Names are stored without their `ARPHRD_` / `ETH_P_` prefix.

/// A read-only symbolic name to integer mapping.
///
/// Several names may share a value (`CISCO` and `HDLC` are both 513); reverse
/// lookups return the first name listed.
#[derive(Debug, Clone, Copy)]
pub struct ConstantTable {
    prefix: &'static str,
    entries: &'static [(&'static str, u16)],
}

impl ConstantTable {
    /// Prefix used when the names are rendered with their C spelling
    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// All entries in declaration order
    pub fn entries(&self) -> &'static [(&'static str, u16)] {
        self.entries
    }

    /// Look up a value by name
    ///
    /// Accepts the bare name (`"ETHER"`) or the prefixed C name
    /// (`"ARPHRD_ETHER"`); matching is case-insensitive.
    pub fn value(&self, name: &str) -> Option<u16> {
        let bare = strip_prefix_ignore_case(name, self.prefix).unwrap_or(name);
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(bare))
            .map(|&(_, v)| v)
    }

    /// Look up the first name registered for a value
    pub fn name(&self, value: u16) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|&&(_, v)| v == value)
            .map(|&(n, _)| n)
    }

    /// Number of entries (aliases included)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.len() >= prefix.len() && name.is_char_boundary(prefix.len()) {
        let (head, tail) = name.split_at(prefix.len());
        if head.eq_ignore_ascii_case(prefix) {
            return Some(tail);
        }
    }
    None
}

/// Hardware types (`ARPHRD_*`), as reported in `NFULA_HWTYPE`
pub static HWTYPES: ConstantTable = ConstantTable {
    prefix: "ARPHRD_",
    entries: HWTYPE_ENTRIES,
};

/// Link-layer protocols (`ETH_P_*`), as reported in `NFULA_PACKET_HDR`
pub static PROTOS: ConstantTable = ConstantTable {
    prefix: "ETH_P_",
    entries: PROTO_ENTRIES,
};

/// Resolve a hardware-type name to its value
pub fn hwtype_value(name: &str) -> Option<u16> {
    HWTYPES.value(name)
}

/// Resolve a hardware-type value to its name
pub fn hwtype_name(value: u16) -> Option<&'static str> {
    HWTYPES.name(value)
}

/// Resolve a protocol name to its value
pub fn proto_value(name: &str) -> Option<u16> {
    PROTOS.value(name)
}

/// Resolve a protocol value to its name
pub fn proto_name(value: u16) -> Option<&'static str> {
    PROTOS.name(value)
}

const HWTYPE_ENTRIES: &[(&str, u16)] = &[
    ("NETROM", 0),
    ("ETHER", 1),
    ("EETHER", 2),
    ("AX25", 3),
    ("PRONET", 4),
    ("CHAOS", 5),
    ("IEEE802", 6),
    ("ARCNET", 7),
    ("APPLETLK", 8),
    ("DLCI", 15),
    ("ATM", 19),
    ("METRICOM", 23),
    ("IEEE1394", 24),
    ("EUI64", 27),
    ("INFINIBAND", 32),
    ("SLIP", 256),
    ("CSLIP", 257),
    ("SLIP6", 258),
    ("CSLIP6", 259),
    ("RSRVD", 260),
    ("ADAPT", 264),
    ("ROSE", 270),
    ("X25", 271),
    ("HWX25", 272),
    ("CAN", 280),
    ("PPP", 512),
    ("CISCO", 513),
    ("HDLC", 513),
    ("LAPB", 516),
    ("DDCMP", 517),
    ("RAWHDLC", 518),
    ("RAWIP", 519),
    ("TUNNEL", 768),
    ("TUNNEL6", 769),
    ("FRAD", 770),
    ("SKIP", 771),
    ("LOOPBACK", 772),
    ("LOCALTLK", 773),
    ("FDDI", 774),
    ("BIF", 775),
    ("SIT", 776),
    ("IPDDP", 777),
    ("IPGRE", 778),
    ("PIMREG", 779),
    ("HIPPI", 780),
    ("ASH", 781),
    ("ECONET", 782),
    ("IRDA", 783),
    ("FCPP", 784),
    ("FCAL", 785),
    ("FCPL", 786),
    ("FCFABRIC", 787),
    ("IEEE802_TR", 800),
    ("IEEE80211", 801),
    ("IEEE80211_PRISM", 802),
    ("IEEE80211_RADIOTAP", 803),
    ("IEEE802154", 804),
    ("IEEE802154_MONITOR", 805),
    ("PHONET", 820),
    ("PHONET_PIPE", 821),
    ("CAIF", 822),
    ("IP6GRE", 823),
    ("NETLINK", 824),
    ("6LOWPAN", 825),
    ("VSOCKMON", 826),
    ("VOID", 0xFFFF),
    ("NONE", 0xFFFE),
];

const PROTO_ENTRIES: &[(&str, u16)] = &[
    ("LOOP", 0x0060),
    ("PUP", 0x0200),
    ("PUPAT", 0x0201),
    ("TSN", 0x22F0),
    ("ERSPAN2", 0x22EB),
    ("IP", 0x0800),
    ("X25", 0x0805),
    ("ARP", 0x0806),
    ("BPQ", 0x08FF),
    ("IEEEPUP", 0x0a00),
    ("IEEEPUPAT", 0x0a01),
    ("BATMAN", 0x4305),
    ("DEC", 0x6000),
    ("DNA_DL", 0x6001),
    ("DNA_RC", 0x6002),
    ("DNA_RT", 0x6003),
    ("LAT", 0x6004),
    ("DIAG", 0x6005),
    ("CUST", 0x6006),
    ("SCA", 0x6007),
    ("TEB", 0x6558),
    ("RARP", 0x8035),
    ("ATALK", 0x809B),
    ("AARP", 0x80F3),
    ("8021Q", 0x8100),
    ("ERSPAN", 0x88BE),
    ("IPX", 0x8137),
    ("IPV6", 0x86DD),
    ("PAUSE", 0x8808),
    ("SLOW", 0x8809),
    ("WCCP", 0x883E),
    ("MPLS_UC", 0x8847),
    ("MPLS_MC", 0x8848),
    ("ATMMPOA", 0x884c),
    ("PPP_DISC", 0x8863),
    ("PPP_SES", 0x8864),
    ("LINK_CTL", 0x886c),
    ("ATMFATE", 0x8884),
    ("PAE", 0x888E),
    ("AOE", 0x88A2),
    ("8021AD", 0x88A8),
    ("802_EX1", 0x88B5),
    ("PREAUTH", 0x88C7),
    ("TIPC", 0x88CA),
    ("LLDP", 0x88CC),
    ("MACSEC", 0x88E5),
    ("8021AH", 0x88E7),
    ("MVRP", 0x88F5),
    ("1588", 0x88F7),
    ("NCSI", 0x88F8),
    ("PRP", 0x88FB),
    ("FCOE", 0x8906),
    ("IBOE", 0x8915),
    ("TDLS", 0x890D),
    ("FIP", 0x8914),
    ("80221", 0x8917),
    ("HSR", 0x892F),
    ("NSH", 0x894F),
    ("LOOPBACK", 0x9000),
    ("QINQ1", 0x9100),
    ("QINQ2", 0x9200),
    ("QINQ3", 0x9300),
    ("EDSA", 0xDADA),
    ("DSA_8021Q", 0xDADB),
    ("IFE", 0xED3E),
    ("AF_IUCV", 0xFBFB),
    ("802_3_MIN", 0x0600),
    ("802_3", 0x0001),
    ("AX25", 0x0002),
    ("ALL", 0x0003),
    ("802_2", 0x0004),
    ("SNAP", 0x0005),
    ("DDCMP", 0x0006),
    ("WAN_PPP", 0x0007),
    ("PPP_MP", 0x0008),
    ("LOCALTALK", 0x0009),
    ("CAN", 0x000C),
    ("CANFD", 0x000D),
    ("PPPTALK", 0x0010),
    ("TR_802_2", 0x0011),
    ("MOBITEX", 0x0015),
    ("CONTROL", 0x0016),
    ("IRDA", 0x0017),
    ("ECONET", 0x0018),
    ("HDLC", 0x0019),
    ("ARCNET", 0x001A),
    ("DSA", 0x001B),
    ("TRAILER", 0x001C),
    ("PHONET", 0x00F5),
    ("IEEE802154", 0x00F6),
    ("CAIF", 0x00F7),
    ("XDSA", 0x00F8),
    ("MAP", 0x00F9),
];
