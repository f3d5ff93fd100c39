//! Registry dispatcher: host passes control datagrams, registry mutates the directory and returns
//! the datagrams to send. No I/O; one message is fully handled before the next.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::directory::{Directory, DirectoryError};
use crate::protocol::Message;
use crate::wire;

/// Datagram for the host to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send(SocketAddr, Message),
}

/// Owner of the authoritative directory.
#[derive(Debug, Default)]
pub struct Registry {
    directory: Directory,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Decode and dispatch one datagram. Anything that does not decode is dropped.
    pub fn on_datagram(&mut self, from: SocketAddr, bytes: &[u8]) -> Vec<OutboundAction> {
        match wire::decode_message(bytes) {
            Ok(msg) => self.on_message(from, msg),
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable datagram");
                Vec::new()
            }
        }
    }

    /// Apply one message and return replies followed by broadcasts, in send order.
    pub fn on_message(&mut self, from: SocketAddr, msg: Message) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        match msg {
            Message::Register {
                identity,
                address,
                control_port,
                transfer_port,
            } => match self
                .directory
                .upsert(&identity, address, control_port, transfer_port)
            {
                Ok(_) => {
                    info!(%identity, %address, control_port, transfer_port, "peer registered");
                    actions.push(OutboundAction::Send(
                        from,
                        Message::Welcome(self.directory.snapshot()),
                    ));
                    self.broadcast(&mut actions);
                }
                Err(DirectoryError::Conflict(_)) => {
                    warn!(%identity, %from, "registration rejected: identity already online");
                    actions.push(OutboundAction::Send(from, Message::Error));
                }
                Err(e) => warn!(%identity, error = %e, "registration failed"),
            },
            Message::Dereg { identity } => match self.directory.set_offline(&identity) {
                Ok(()) => {
                    info!(%identity, "peer deregistered");
                    actions.push(OutboundAction::Send(from, Message::Ack));
                    self.broadcast(&mut actions);
                }
                Err(_) => info!(%identity, %from, "deregistration for unknown peer ignored"),
            },
            Message::Disconnect { identity } => match self.directory.set_offline(&identity) {
                Ok(()) => {
                    info!(%identity, "peer disconnected");
                    self.broadcast(&mut actions);
                }
                Err(_) => info!(%identity, %from, "disconnect for unknown peer ignored"),
            },
            Message::Offer { identity, files } => {
                // Offline-but-known identities are accepted; the record stays offline.
                match self.directory.add_files(&identity, &files) {
                    Ok(added) => {
                        info!(%identity, added = added.len(), offered = files.len(), "offer applied");
                        self.broadcast(&mut actions);
                        actions.push(OutboundAction::Send(from, Message::Ack));
                    }
                    Err(_) => info!(%identity, %from, "offer from unknown peer dropped"),
                }
            }
            Message::Ack => {}
            other => debug!(keyword = other.keyword(), %from, "ignoring server-bound message"),
        }
        actions
    }

    /// Full snapshot to every online peer; a `DISCONNECTED` notice to every offline one.
    fn broadcast(&self, actions: &mut Vec<OutboundAction>) {
        let snapshot = self.directory.snapshot();
        for record in self.directory.iter() {
            let msg = if record.online {
                Message::Update(snapshot.clone())
            } else {
                Message::Disconnected {
                    identity: record.identity.clone(),
                }
            };
            actions.push(OutboundAction::Send(record.control_addr(), msg));
        }
    }
}
