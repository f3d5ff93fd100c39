//! At-least-once delivery over an unreliable datagram send: transmit, wait for a bare `ACK` from the
//! destination, retransmit on timeout, give up after a bounded number of sends.
//!
//! The layer never reads a socket itself. Whoever owns the receive side hands every `ACK` it sees to an
//! [`AckMailbox`]; acks arriving while nothing is waiting are discarded.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::Message;
use crate::wire::{self, EncodeError};

/// Default total sends per reliable exchange.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default wait for an acknowledgment after each send.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything that can fire one datagram at an address.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_datagram(&self, payload: &[u8], dest: SocketAddr) -> std::io::Result<()>;
}

#[async_trait]
impl DatagramSink for UdpSocket {
    async fn send_datagram(&self, payload: &[u8], dest: SocketAddr) -> std::io::Result<()> {
        self.send_to(payload, dest).await.map(|_| ())
    }
}

/// Bounds for one reliable exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total sends, first transmission included. Zero is treated as one.
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// Hand-off point between the receive loop and a waiting reliable send.
/// Only one exchange is in flight at a time, since a bare `ACK` carries no correlation id.
/// A late `ACK` for a retransmission of one exchange that arrives after the next exchange has armed
/// the mailbox is taken as that exchange's acknowledgment; the protocol cannot tell them apart.
#[derive(Debug, Default)]
pub struct AckMailbox {
    waiter: Mutex<Option<mpsc::UnboundedSender<SocketAddr>>>,
    exclusive: Mutex<()>,
}

impl AckMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass an `ACK` received from `from`. Returns false when no exchange was waiting (ack discarded).
    pub async fn deliver(&self, from: SocketAddr) -> bool {
        match self.waiter.lock().await.as_ref() {
            Some(tx) => tx.send(from).is_ok(),
            None => {
                debug!(%from, "discarding unsolicited ack");
                false
            }
        }
    }

    async fn arm(&self) -> mpsc::UnboundedReceiver<SocketAddr> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.waiter.lock().await = Some(tx);
        rx
    }

    async fn disarm(&self) {
        *self.waiter.lock().await = None;
    }
}

/// In-flight state of one reliable exchange.
struct PendingAck<'a> {
    payload: &'a [u8],
    destination: SocketAddr,
    attempts: u32,
    deadline: Instant,
}

/// Send `message` to `destination` until acknowledged or `policy.max_attempts` sends have timed out.
/// Returns the number of sends it took.
pub async fn send_reliable<S>(
    sink: &S,
    mailbox: &AckMailbox,
    message: &Message,
    destination: SocketAddr,
    policy: RetryPolicy,
) -> Result<u32, DeliveryError>
where
    S: DatagramSink + ?Sized,
{
    let payload = wire::encode_message(message)?;
    let _exclusive = mailbox.exclusive.lock().await;
    let mut acks = mailbox.arm().await;
    let mut pending = PendingAck {
        payload: &payload,
        destination,
        attempts: 0,
        deadline: Instant::now(),
    };
    let outcome = exchange(sink, &mut acks, &mut pending, policy).await;
    mailbox.disarm().await;
    match &outcome {
        Ok(attempts) => debug!(keyword = message.keyword(), %destination, attempts, "acknowledged"),
        Err(e) => warn!(keyword = message.keyword(), %destination, error = %e, "reliable send gave up"),
    }
    outcome
}

async fn exchange<S>(
    sink: &S,
    acks: &mut mpsc::UnboundedReceiver<SocketAddr>,
    pending: &mut PendingAck<'_>,
    policy: RetryPolicy,
) -> Result<u32, DeliveryError>
where
    S: DatagramSink + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    while pending.attempts < max_attempts {
        sink.send_datagram(pending.payload, pending.destination).await?;
        pending.attempts += 1;
        pending.deadline = Instant::now() + policy.attempt_timeout;
        loop {
            match tokio::time::timeout_at(pending.deadline, acks.recv()).await {
                Ok(Some(from)) if from == pending.destination => return Ok(pending.attempts),
                Ok(Some(from)) => debug!(%from, "ack from unexpected source ignored"),
                // Timed out, or the mailbox went away: move on to the next send.
                Ok(None) | Err(_) => break,
            }
        }
        debug!(attempt = pending.attempts, max_attempts, "no ack before deadline");
    }
    Err(DeliveryError::DeliveryFailed {
        attempts: pending.attempts,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no acknowledgment after {attempts} attempts")]
    DeliveryFailed { attempts: u32 },
    #[error("send failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot encode message: {0}")]
    Encode(#[from] EncodeError),
}
