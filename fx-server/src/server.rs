//! Registry host: one UDP socket, one receive loop. Each datagram is dispatched and its replies and
//! broadcasts are sent before the next datagram is read, so the registry needs no locking.

use std::io;
use std::net::SocketAddr;

use fx_core::{encode_message, Directory, OutboundAction, Registry, MAX_DATAGRAM_LEN};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

pub struct RegistryServer {
    socket: UdpSocket,
    registry: Registry,
}

impl RegistryServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            registry: Registry::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn directory(&self) -> &Directory {
        self.registry.directory()
    }

    /// Receive and dispatch until the socket fails.
    pub async fn run(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "registry server listening");
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, from)) => self.handle(from, &buf[..n]).await,
                // ICMP port-unreachable from a vanished peer surfaces here on some platforms.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!(error = %e, "ignoring connection reset");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dispatch one datagram and send the resulting actions in order. Send failures are logged only.
    pub async fn handle(&mut self, from: SocketAddr, bytes: &[u8]) {
        let actions = self.registry.on_datagram(from, bytes);
        for OutboundAction::Send(to, msg) in actions {
            let frame = match encode_message(&msg) {
                Ok(f) => f,
                Err(e) => {
                    warn!(%to, keyword = msg.keyword(), error = %e, "cannot encode outbound message");
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&frame, to).await {
                warn!(%to, keyword = msg.keyword(), error = %e, "send failed");
            } else {
                debug!(%to, keyword = msg.keyword(), "sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fx_core::{decode_message, Message};
    use std::time::Duration;

    async fn recv(sock: &UdpSocket) -> Message {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), sock.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        decode_message(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn register_over_udp_gets_welcome_then_update() {
        let server = RegistryServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let register = format!("REGISTER alice 127.0.0.1 {port} 6000");
        peer.send_to(register.as_bytes(), server_addr).await.unwrap();

        let expected = format!("alice 127.0.0.1 {port} 6000 1");
        match recv(&peer).await {
            Message::Welcome(s) => assert_eq!(s.as_str(), expected),
            other => panic!("expected WELCOME, got {other:?}"),
        }
        match recv(&peer).await {
            Message::Update(s) => assert_eq!(s.as_str(), expected),
            other => panic!("expected UPDATE, got {other:?}"),
        }

        peer.send_to(register.as_bytes(), server_addr).await.unwrap();
        assert_eq!(recv(&peer).await, Message::Error);
    }

    #[tokio::test]
    async fn garbage_does_not_stop_the_loop() {
        let mut server = RegistryServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        server.handle(from, b"\xff\xfe").await;
        server.handle(from, b"BOGUS 1 2 3").await;
        server.handle(from, b"REGISTER alice 127.0.0.1 1 2").await;
        assert_eq!(server.directory().len(), 1);
    }
}
