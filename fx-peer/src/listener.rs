//! Update listener: the only reader of the control socket after registration.
//! Snapshots replace the cached directory, acks go to the reliability mailbox.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use fx_core::{
    decode_message, encode_message, AckMailbox, Directory, Message, Snapshot, SnapshotError,
    MAX_DATAGRAM_LEN,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::agent::{AgentEvent, PeerState};

/// Receive control datagrams from `server` until the socket fails.
/// Datagrams from any other source are dropped.
pub async fn run_update_listener(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    state: Arc<Mutex<PeerState>>,
    acks: Arc<AckMailbox>,
    events: mpsc::UnboundedSender<AgentEvent>,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(error = %e, "ignoring connection reset");
                continue;
            }
            Err(e) => return Err(e),
        };
        if from != server {
            debug!(%from, "ignoring datagram from non-server source");
            continue;
        }
        let msg = match decode_message(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "ignoring undecodable datagram");
                continue;
            }
        };
        match msg {
            Message::Update(snapshot) | Message::Welcome(snapshot) => {
                match apply_snapshot(&state, &snapshot).await {
                    Ok(true) => {
                        let _ = events.send(AgentEvent::DirectoryChanged);
                    }
                    Ok(false) => debug!("broadcast left directory unchanged"),
                    Err(e) => warn!(error = %e, "dropping malformed snapshot"),
                }
                // Courtesy ack; the server does not wait for it.
                if let Ok(frame) = encode_message(&Message::Ack) {
                    if let Err(e) = socket.send_to(&frame, server).await {
                        debug!(error = %e, "ack for update not sent");
                    }
                }
            }
            Message::Ack => {
                acks.deliver(from).await;
            }
            Message::Disconnected { identity } => {
                info!(%identity, "server reports this peer offline");
                let _ = events.send(AgentEvent::Disconnected { identity });
            }
            other => debug!(keyword = other.keyword(), "ignoring unexpected message"),
        }
    }
}

/// Replace the cached directory with `snapshot`. Returns whether the contents changed.
pub async fn apply_snapshot(
    state: &Mutex<PeerState>,
    snapshot: &Snapshot,
) -> Result<bool, SnapshotError> {
    let incoming = Directory::from_snapshot(snapshot)?;
    let mut state = state.lock().await;
    if state.directory == incoming {
        return Ok(false);
    }
    state.directory = incoming;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn empty_state() -> Arc<Mutex<PeerState>> {
        Arc::new(Mutex::new(PeerState {
            directory: Directory::new(),
            working_dir: PathBuf::from("."),
        }))
    }

    #[tokio::test]
    async fn identical_snapshot_is_not_a_change() {
        let state = empty_state();
        let snap = Snapshot::from_text("alice 127.0.0.1 5000 6000 1 a.txt");
        assert!(apply_snapshot(&state, &snap).await.unwrap());
        assert!(!apply_snapshot(&state, &snap).await.unwrap());
        let snap2 = Snapshot::from_text("alice 127.0.0.1 5000 6000 0 a.txt");
        assert!(apply_snapshot(&state, &snap2).await.unwrap());
        assert!(!state.lock().await.directory.get("alice").unwrap().online);
    }

    #[tokio::test]
    async fn malformed_snapshot_keeps_cache() {
        let state = empty_state();
        let good = Snapshot::from_text("alice 127.0.0.1 5000 6000 1");
        apply_snapshot(&state, &good).await.unwrap();
        let bad = Snapshot::from_text("alice 127.0.0.1 notaport 6000 1");
        assert!(apply_snapshot(&state, &bad).await.is_err());
        assert!(state.lock().await.directory.contains("alice"));
    }

    #[tokio::test]
    async fn routes_server_datagrams_only() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer_addr = peer.local_addr().unwrap();
        let state = empty_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(run_update_listener(
            peer,
            server.local_addr().unwrap(),
            state.clone(),
            Arc::new(AckMailbox::new()),
            tx,
        ));

        stranger
            .send_to(b"UPDATE mallory 127.0.0.1 1 2 1", peer_addr)
            .await
            .unwrap();
        server
            .send_to(b"UPDATE alice 127.0.0.1 5000 6000 1", peer_addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(event, Some(AgentEvent::DirectoryChanged));
        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ACK");

        let dir = state.lock().await.directory.clone();
        assert!(dir.contains("alice"));
        assert!(!dir.contains("mallory"));

        server.send_to(b"DISCONNECTED alice", peer_addr).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(AgentEvent::Disconnected {
                identity: "alice".into()
            })
        );
    }
}
