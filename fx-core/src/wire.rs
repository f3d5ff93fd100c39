//! Control-plane codec: one message per datagram, UTF-8, space-separated tokens.
//! Snapshot-carrying messages put the snapshot after the first space, newlines included.

use std::net::IpAddr;

use crate::directory::Snapshot;
use crate::protocol::{validate_name, Message, NameError, MAX_DATAGRAM_LEN};

/// Encode a message into datagram bytes. Names are validated so a message never splits into extra tokens.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut out = String::from(msg.keyword());
    match msg {
        Message::Register {
            identity,
            address,
            control_port,
            transfer_port,
        } => {
            validate_name(identity)?;
            out.push_str(&format!(" {identity} {address} {control_port} {transfer_port}"));
        }
        Message::Welcome(snapshot) | Message::Update(snapshot) => {
            if !snapshot.is_empty() {
                out.push(' ');
                out.push_str(snapshot.as_str());
            }
        }
        Message::Dereg { identity }
        | Message::Disconnected { identity }
        | Message::Disconnect { identity } => {
            validate_name(identity)?;
            out.push(' ');
            out.push_str(identity);
        }
        Message::Offer { identity, files } => {
            validate_name(identity)?;
            out.push(' ');
            out.push_str(identity);
            for file in files {
                validate_name(file)?;
                out.push(' ');
                out.push_str(file);
            }
        }
        Message::Error | Message::Ack => {}
    }
    if out.len() > MAX_DATAGRAM_LEN {
        return Err(EncodeError::TooLarge(out.len()));
    }
    Ok(out.into_bytes())
}

/// Decode one datagram. Unknown keywords and malformed fields are errors; callers decide whether to log or drop.
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    let text = text.trim_start();
    let (keyword, rest) = match text.split_once(' ') {
        Some((k, r)) => (k, r),
        None => (text.trim_end(), ""),
    };
    let mut args = rest.split_whitespace();
    let msg = match keyword {
        "REGISTER" => {
            let identity = required(&mut args, "identity")?;
            let address: IpAddr = required(&mut args, "address")?
                .parse()
                .map_err(|_| DecodeError::BadAddress)?;
            let control_port = port(required(&mut args, "control port")?)?;
            let transfer_port = port(required(&mut args, "transfer port")?)?;
            no_more(&mut args)?;
            Message::Register {
                identity,
                address,
                control_port,
                transfer_port,
            }
        }
        "WELCOME" => Message::Welcome(Snapshot::from_text(rest)),
        "UPDATE" => Message::Update(Snapshot::from_text(rest)),
        "ERROR" => Message::Error,
        "ACK" => Message::Ack,
        "DEREG" => {
            let identity = required(&mut args, "identity")?;
            no_more(&mut args)?;
            Message::Dereg { identity }
        }
        "DISCONNECTED" => {
            let identity = required(&mut args, "identity")?;
            no_more(&mut args)?;
            Message::Disconnected { identity }
        }
        "DISCONNECT" => {
            let identity = required(&mut args, "identity")?;
            no_more(&mut args)?;
            Message::Disconnect { identity }
        }
        "OFFER" => {
            let identity = required(&mut args, "identity")?;
            let files = args.map(str::to_string).collect();
            Message::Offer { identity, files }
        }
        "" => return Err(DecodeError::Empty),
        other => return Err(DecodeError::UnknownKeyword(other.to_string())),
    };
    Ok(msg)
}

fn required<'a>(
    args: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<String, DecodeError> {
    args.next()
        .map(str::to_string)
        .ok_or(DecodeError::MissingField(field))
}

fn no_more<'a>(args: &mut impl Iterator<Item = &'a str>) -> Result<(), DecodeError> {
    match args.next() {
        None => Ok(()),
        Some(_) => Err(DecodeError::TrailingTokens),
    }
}

fn port(s: String) -> Result<u16, DecodeError> {
    s.parse().map_err(|_| DecodeError::BadPort(s))
}

/// Error encoding a message (name rules or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),
    #[error("message of {0} bytes exceeds datagram limit")]
    TooLarge(usize),
}

/// Error decoding a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram is not UTF-8")]
    NotUtf8,
    #[error("empty datagram")]
    Empty,
    #[error("unknown keyword {0:?}")]
    UnknownKeyword(String),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("invalid address")]
    BadAddress,
    #[error("invalid port {0:?}")]
    BadPort(String),
    #[error("unexpected trailing tokens")]
    TrailingTokens,
}
