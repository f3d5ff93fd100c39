//! fxchange peer: registration and directory mirroring over UDP, file transfer over TCP.

pub mod agent;
pub mod config;
pub mod listener;
pub mod transfer;

pub use agent::{AgentError, AgentEvent, PeerAgent, PeerState};
pub use config::PeerConfig;
pub use transfer::{TransferError, TransferOptions};
