//! Control-plane message types and name rules.

use std::net::IpAddr;

use crate::directory::Snapshot;

/// Largest control datagram sent or accepted.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// All control-plane messages. Encoding is space-separated text, one message per datagram (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Peer asks to join the directory under `identity`.
    Register {
        identity: String,
        address: IpAddr,
        control_port: u16,
        transfer_port: u16,
    },
    /// Registration accepted; carries the full directory.
    Welcome(Snapshot),
    /// Registration rejected: identity already online.
    Error,
    /// Graceful leave. Answered with `Ack`.
    Dereg { identity: String },
    /// Advertise files under `identity`. Answered with `Ack`.
    Offer { identity: String, files: Vec<String> },
    /// Unsolicited full directory push.
    Update(Snapshot),
    /// Unsolicited notice sent to peers recorded offline.
    Disconnected { identity: String },
    /// Best-effort leave, no reply.
    Disconnect { identity: String },
    /// Bare correlation signal for the reliability layer.
    Ack,
}

impl Message {
    /// Leading keyword on the wire.
    pub fn keyword(&self) -> &'static str {
        match self {
            Message::Register { .. } => "REGISTER",
            Message::Welcome(_) => "WELCOME",
            Message::Error => "ERROR",
            Message::Dereg { .. } => "DEREG",
            Message::Offer { .. } => "OFFER",
            Message::Update(_) => "UPDATE",
            Message::Disconnected { .. } => "DISCONNECTED",
            Message::Disconnect { .. } => "DISCONNECT",
            Message::Ack => "ACK",
        }
    }
}

/// Identities and file names travel as bare tokens, so they must be non-empty and free of whitespace.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().any(char::is_whitespace) {
        return Err(NameError::Whitespace(name.to_string()));
    }
    Ok(())
}

/// A name that cannot be carried as a single wire token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name contains whitespace: {0:?}")]
    Whitespace(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_without_whitespace_are_valid() {
        assert!(validate_name("alice").is_ok());
        assert!(validate_name("report.v2.txt").is_ok());
    }

    #[test]
    fn rejects_empty_and_spaced_names() {
        assert_eq!(validate_name(""), Err(NameError::Empty));
        assert!(matches!(
            validate_name("my report.txt"),
            Err(NameError::Whitespace(_))
        ));
        assert!(matches!(validate_name("tab\there"), Err(NameError::Whitespace(_))));
    }
}
