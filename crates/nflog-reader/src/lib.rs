//! Reader for packets logged by netfilter through nfnetlink_log
//!
//! This crate binds a netlink socket to an nflog group (the `--nflog-group`
//! of an iptables `NFLOG` target), receives the kernel's batched packet
//! messages and decodes each one into a [`PacketRecord`]: a verdict plus an
//! attribute tuple indexed by `NFULA_*` type.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Binding a log group requires CAP_NET_ADMIN |
//! | AU-3 | Content of Audit Records | Structured logging of socket lifecycle |
//! | AU-12 | Audit Record Generation | Firewall-logged packets delivered as records |
//! | CM-6 | Configuration Settings | TOML socket configuration |
//! | SC-5 | DoS Protection | Bounded receives, overflow policy |
//! | SI-4 | System Monitoring | Drop accounting on buffer overflow |
//! | SI-10 | Input Validation | Bounds-checked netlink and attribute parsing |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! +-----------------+     +-----------------------+     +----------------+
//! |  Linux Kernel   |     |      NflogSocket      |     |    Consumer    |
//! |                 |     |                       |     |                |
//! | nfnetlink_log   |---->| Transport::recv       |     | Batch of       |
//! | (NFULNL_MSG_    |     |   -> OverflowPolicy   |---->| PacketRecord   |
//! |  PACKET)        |     |   -> assemble_batch   |     |  -> summary    |
//! |                 |     |   -> decode_attributes|     |  -> dump       |
//! +-----------------+     +-----------------------+     +----------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nflog_reader::{NflogSocket, SocketConfig};
//! use std::time::Duration;
//!
//! let config = SocketConfig::new(5).with_receive_timeout(Duration::from_millis(500));
//! NflogSocket::scoped(config, |socket| {
//!     for record in socket.receive()? {
//!         println!("verdict={} payload={:?}", record.verdict(), record.payload());
//!     }
//!     Ok(())
//! })?;
//! # Ok::<(), nflog_reader::NflogError>(())
//! ```

pub mod attr;
pub mod config;
pub mod dump;
pub mod error;
pub mod message;
pub mod overflow;
pub mod packet;
pub mod socket;
pub mod transport;
pub mod types;

pub use attr::{decode_attributes, encode_attributes};
pub use config::{SequenceFlags, SocketConfig};
pub use dump::{parse_dump, read_dump, write_dump, DumpWriter};
pub use error::{NflogError, Result};
pub use message::{assemble_batch, encode_batch, encode_record, scan_batch, Assembly, Scan};
pub use overflow::{OverflowPolicy, OverflowState};
pub use packet::{InterfaceNames, PacketSummary, RecordBuilder, VlanTag};
pub use socket::{Batches, NflogSocket, Records};
pub use transport::{
    Canceller, NetlinkTransport, RecvEvent, ReplayEvent, ReplayTransport, Transport,
};
pub use types::{
    AttrType, AttributeSet, Batch, CopyMode, LogGroup, OverflowMode, PacketRecord, NFULA_MAX,
};
