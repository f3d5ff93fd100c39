//! fxchange protocol core.
//! Directory, control-plane codec and registry are host-driven: no I/O; hosts own the sockets,
//! pass datagrams in and send what comes back out.

pub mod directory;
pub mod protocol;
pub mod registry;
pub mod reliability;
pub mod transfer;
pub mod wire;

pub use directory::{Directory, DirectoryError, PeerRecord, Snapshot, SnapshotError};
pub use protocol::{validate_name, Message, NameError, MAX_DATAGRAM_LEN};
pub use registry::{OutboundAction, Registry};
pub use reliability::{send_reliable, AckMailbox, DatagramSink, DeliveryError, RetryPolicy};
pub use transfer::{Refusal, ResponseHeader, TransferSession};
pub use wire::{decode_message, encode_message, DecodeError, EncodeError};
