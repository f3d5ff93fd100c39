//! Peer agent: owns the control socket, the transfer listener and the cached directory.
//! Registration is a single exchange on the control socket; once WELCOME arrives the update listener
//! and transfer server run as background tasks until the agent is deregistered, disconnected or dropped.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fx_core::transfer::is_plain_file_name;
use fx_core::{
    decode_message, encode_message, send_reliable, validate_name, AckMailbox, DeliveryError,
    Directory, EncodeError, Message, NameError, RetryPolicy, SnapshotError, TransferSession,
    MAX_DATAGRAM_LEN,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::listener::run_update_listener;
use crate::transfer::{fetch_file, run_transfer_server, TransferError, TransferOptions};

/// State shared by the shell, the update listener and the transfer handlers.
#[derive(Debug)]
pub struct PeerState {
    /// Follower copy of the server's directory.
    pub directory: Directory,
    /// Offered files are read from here; fetched files are written here.
    pub working_dir: PathBuf,
}

/// Notifications from the background tasks to whoever drives the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A broadcast changed the cached directory.
    DirectoryChanged,
    /// The server reported this identity offline.
    Disconnected { identity: String },
}

pub struct PeerAgent {
    identity: String,
    server: SocketAddr,
    socket: Arc<UdpSocket>,
    advertise: IpAddr,
    control_port: u16,
    transfer_port: u16,
    state: Arc<Mutex<PeerState>>,
    acks: Arc<AckMailbox>,
    policy: RetryPolicy,
    transfer_opts: TransferOptions,
    register_timeout: Duration,
    transfer_listener: Option<TcpListener>,
    events: mpsc::UnboundedSender<AgentEvent>,
    tasks: Vec<JoinHandle<()>>,
    registered: bool,
}

impl PeerAgent {
    /// Bind both sockets and resolve the server. Nothing is sent until [`PeerAgent::register`].
    pub async fn bind(
        identity: &str,
        config: &PeerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>), AgentError> {
        validate_name(identity)?;
        let server = resolve_server(&config.server_addr, config.bind_addr).await?;

        let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr, config.control_port)).await?;
        let transfer_listener =
            TcpListener::bind(SocketAddr::new(config.bind_addr, config.transfer_port)).await?;
        let control_port = socket.local_addr()?.port();
        let transfer_port = transfer_listener.local_addr()?.port();

        let advertise = match config.advertise_addr {
            Some(ip) => ip,
            None if !config.bind_addr.is_unspecified() => config.bind_addr,
            None => detect_advertise_addr(server)?,
        };

        let working_dir = match &config.share_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        if !tokio::fs::metadata(&working_dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(AgentError::NotADirectory(working_dir));
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        info!(
            identity,
            %server,
            %advertise,
            control_port,
            transfer_port,
            working_dir = %working_dir.display(),
            "peer agent bound"
        );
        let agent = Self {
            identity: identity.to_string(),
            server,
            socket: Arc::new(socket),
            advertise,
            control_port,
            transfer_port,
            state: Arc::new(Mutex::new(PeerState {
                directory: Directory::new(),
                working_dir,
            })),
            acks: Arc::new(AckMailbox::new()),
            policy: config.retry_policy(),
            transfer_opts: config.transfer_options(),
            register_timeout: config.register_timeout(),
            transfer_listener: Some(transfer_listener),
            events,
            tasks: Vec::new(),
            registered: false,
        };
        Ok((agent, events_rx))
    }

    /// Send one REGISTER and wait for WELCOME or ERROR. Not retried.
    /// On WELCOME the cache is replaced and the background tasks start.
    pub async fn register(&mut self) -> Result<(), AgentError> {
        if self.registered {
            return Err(AgentError::AlreadyRegistered);
        }
        let register = Message::Register {
            identity: self.identity.clone(),
            address: self.advertise,
            control_port: self.control_port,
            transfer_port: self.transfer_port,
        };
        self.socket.send_to(&encode_message(&register)?, self.server).await?;
        debug!(server = %self.server, "REGISTER sent");

        let deadline = Instant::now() + self.register_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (n, from) = match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(AgentError::RegisterTimedOut(self.register_timeout)),
            };
            if from != self.server {
                debug!(%from, "ignoring datagram from non-server source");
                continue;
            }
            match decode_message(&buf[..n]) {
                Ok(Message::Welcome(snapshot)) => {
                    let directory = Directory::from_snapshot(&snapshot)?;
                    self.state.lock().await.directory = directory;
                    if let Err(e) = self.send_ack().await {
                        debug!(error = %e, "courtesy ack after WELCOME failed");
                    }
                    break;
                }
                Ok(Message::Error) => return Err(AgentError::Conflict(self.identity.clone())),
                Ok(other) => debug!(keyword = other.keyword(), "ignoring message while registering"),
                Err(e) => debug!(error = %e, "ignoring undecodable datagram while registering"),
            }
        }

        self.registered = true;
        self.start_tasks()?;
        info!(identity = %self.identity, "registered");
        Ok(())
    }

    fn start_tasks(&mut self) -> Result<(), AgentError> {
        let listener = self.transfer_listener.take().ok_or(AgentError::AlreadyRegistered)?;

        let (socket, server, state, acks, events) = (
            self.socket.clone(),
            self.server,
            self.state.clone(),
            self.acks.clone(),
            self.events.clone(),
        );
        let updates = tokio::spawn(async move {
            if let Err(e) = run_update_listener(socket, server, state, acks, events).await {
                warn!(error = %e, "update listener stopped");
            }
        });
        let state = self.state.clone();
        let opts = self.transfer_opts;
        let transfers = tokio::spawn(async move {
            if let Err(e) = run_transfer_server(listener, state, opts).await {
                warn!(error = %e, "transfer server stopped");
            }
        });
        self.tasks.push(updates);
        self.tasks.push(transfers);
        Ok(())
    }

    /// Offer files from the working directory. Names that are not plain names of regular files there
    /// are skipped. Returns the names actually sent, once the server has acknowledged them.
    pub async fn offer<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>, AgentError> {
        self.ensure_registered()?;
        let working_dir = self.state.lock().await.working_dir.clone();
        let mut files: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref();
            if !is_plain_file_name(name) {
                warn!(file = name, "not a plain file name; skipped");
                continue;
            }
            if files.iter().any(|f| f == name) {
                continue;
            }
            match tokio::fs::metadata(working_dir.join(name)).await {
                Ok(meta) if meta.is_file() => files.push(name.to_string()),
                _ => warn!(file = name, dir = %working_dir.display(), "no such file in working directory; skipped"),
            }
        }
        if files.is_empty() {
            return Err(AgentError::NothingToOffer);
        }

        // Shown locally right away; the next broadcast replaces it either way.
        if let Err(e) = self.state.lock().await.directory.add_files(&self.identity, &files) {
            debug!(error = %e, "own record missing from cache");
        }

        let offer = Message::Offer {
            identity: self.identity.clone(),
            files: files.clone(),
        };
        let attempts =
            send_reliable(self.socket.as_ref(), &self.acks, &offer, self.server, self.policy).await?;
        info!(count = files.len(), attempts, "files offered");
        Ok(files)
    }

    /// Leave the directory gracefully. Background tasks stop whether or not the server acknowledged.
    pub async fn deregister(mut self) -> Result<u32, AgentError> {
        self.ensure_registered()?;
        let dereg = Message::Dereg {
            identity: self.identity.clone(),
        };
        let outcome =
            send_reliable(self.socket.as_ref(), &self.acks, &dereg, self.server, self.policy).await;
        self.stop_tasks();
        let attempts = outcome?;
        info!(identity = %self.identity, attempts, "deregistered");
        Ok(attempts)
    }

    /// Stop the background tasks and release both sockets. Unless `silent`, tell the server first
    /// with a single unacknowledged DISCONNECT.
    pub async fn disconnect(mut self, silent: bool) {
        if self.registered && !silent {
            let disconnect = Message::Disconnect {
                identity: self.identity.clone(),
            };
            match encode_message(&disconnect) {
                Ok(frame) => {
                    if let Err(e) = self.socket.send_to(&frame, self.server).await {
                        warn!(error = %e, "DISCONNECT send failed");
                    }
                }
                Err(e) => warn!(error = %e, "cannot encode DISCONNECT"),
            }
        }
        self.stop_tasks();
        info!(identity = %self.identity, silent, "disconnected");
    }

    /// Fetch `file_name` from `target` (matched ignoring case) into the working directory.
    /// The cached directory must list the file under that peer; otherwise no connection is made.
    pub async fn request_file(
        &self,
        file_name: &str,
        target: &str,
    ) -> Result<TransferSession, AgentError> {
        let (addr, owner, dest_dir) = {
            let state = self.state.lock().await;
            let record = state
                .directory
                .find_case_insensitive(target)
                .ok_or_else(|| AgentError::UnknownPeer(target.to_string()))?;
            if record.identity == self.identity {
                return Err(AgentError::SelfRequest);
            }
            if !record.offers(file_name) {
                return Err(AgentError::NotOffered {
                    file: file_name.to_string(),
                    peer: record.identity.clone(),
                });
            }
            (record.transfer_addr(), record.identity.clone(), state.working_dir.clone())
        };
        info!(file = file_name, peer = %owner, %addr, "requesting file");
        Ok(fetch_file(addr, file_name, &dest_dir, self.transfer_opts).await?)
    }

    /// Change the working directory. Returns the canonical path now in use.
    pub async fn set_working_dir(&self, path: &Path) -> Result<PathBuf, AgentError> {
        let is_dir = tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(AgentError::NotADirectory(path.to_path_buf()));
        }
        let dir = tokio::fs::canonicalize(path).await?;
        self.state.lock().await.working_dir = dir.clone();
        info!(dir = %dir.display(), "working directory changed");
        Ok(dir)
    }

    /// Copy of the cached directory.
    pub async fn directory(&self) -> Directory {
        self.state.lock().await.directory.clone()
    }

    pub async fn working_dir(&self) -> PathBuf {
        self.state.lock().await.working_dir.clone()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn advertise_addr(&self) -> IpAddr {
        self.advertise
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn transfer_port(&self) -> u16 {
        self.transfer_port
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    fn ensure_registered(&self) -> Result<(), AgentError> {
        if self.registered {
            Ok(())
        } else {
            Err(AgentError::NotRegistered)
        }
    }

    async fn send_ack(&self) -> Result<(), AgentError> {
        self.socket.send_to(&encode_message(&Message::Ack)?, self.server).await?;
        Ok(())
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for PeerAgent {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Resolve `host:port`, preferring an address of the same family as the bind address.
async fn resolve_server(server: &str, bind_addr: IpAddr) -> Result<SocketAddr, AgentError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server)
        .await
        .map_err(|_| AgentError::ServerAddr(server.to_string()))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4() == bind_addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| AgentError::ServerAddr(server.to_string()))
}

/// Local address of the route towards the server. Connecting a UDP socket sends nothing.
fn detect_advertise_addr(server: SocketAddr) -> io::Result<IpAddr> {
    if server.ip().is_loopback() {
        return Ok(server.ip());
    }
    let unspecified: IpAddr = if server.is_ipv4() {
        IpAddr::from([0, 0, 0, 0])
    } else {
        IpAddr::from([0u16; 8])
    };
    let probe = std::net::UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    probe.connect(server)?;
    Ok(probe.local_addr()?.ip())
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("identity {0:?} is already online")]
    Conflict(String),
    #[error("no answer to REGISTER within {0:?}")]
    RegisterTimedOut(Duration),
    #[error("cannot resolve server address {0:?}")]
    ServerAddr(String),
    #[error("unknown peer {0:?}")]
    UnknownPeer(String),
    #[error("{peer} does not offer {file:?}")]
    NotOffered { file: String, peer: String },
    #[error("none of the given files can be offered")]
    NothingToOffer,
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] NameError),
    #[error("not registered")]
    NotRegistered,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("cannot request a file from yourself")]
    SelfRequest,
    #[error("{0}")]
    Delivery(#[from] DeliveryError),
    #[error("{0}")]
    Transfer(#[from] TransferError),
    #[error("bad snapshot from server: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("cannot encode message: {0}")]
    Encode(#[from] EncodeError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}
