//! Transfer service: serve files from the working directory to other peers (one task per connection)
//! and fetch files from them. One connection carries exactly one request.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fx_core::transfer::{
    encode_request, is_plain_file_name, parse_request, FrameError, Refusal, ResponseHeader,
    TransferSession, DEFAULT_CHUNK_SIZE, MAX_HEADER_LEN,
};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::agent::PeerState;

/// Timeouts and buffer size for both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Bound on connect and on every single read or write.
    pub io_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Accept transfer connections until the listener fails; each one is handled on its own task.
pub async fn run_transfer_server(
    listener: TcpListener,
    state: Arc<Mutex<PeerState>>,
    opts: TransferOptions,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "transfer connection accepted");
        let state = state.clone();
        tokio::spawn(async move {
            let working_dir = state.lock().await.working_dir.clone();
            match serve_connection(stream, &working_dir, opts).await {
                Ok(Some(session)) => info!(
                    %peer,
                    file = %session.file_name,
                    bytes = session.transferred(),
                    "file sent"
                ),
                Ok(None) => {}
                Err(e) => warn!(%peer, error = %e, "transfer to peer failed"),
            }
        });
    }
}

/// Serve one request read from `stream`, resolving the name against `working_dir`.
/// Returns the session when content was streamed, `None` when the request was refused.
pub async fn serve_connection(
    stream: TcpStream,
    working_dir: &Path,
    opts: TransferOptions,
) -> Result<Option<TransferSession>, TransferError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let line = read_request_line(&mut reader, opts.io_timeout).await?;

    let name = match parse_request(&line) {
        Ok(name) if is_plain_file_name(&name) => name,
        _ => {
            debug!(request = %line.trim_end(), "bad transfer request");
            send_header(&mut writer, &ResponseHeader::Error(Refusal::BadRequest), opts).await?;
            return Ok(None);
        }
    };

    let path = working_dir.join(&name);
    let file = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => match File::open(&path).await {
            Ok(f) => Some((f, meta.len())),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open offered file");
                None
            }
        },
        _ => None,
    };
    let Some((mut file, size)) = file else {
        info!(file = %name, "requested file not found");
        send_header(&mut writer, &ResponseHeader::Error(Refusal::NotFound), opts).await?;
        return Ok(None);
    };

    send_header(&mut writer, &ResponseHeader::Size(size), opts).await?;
    let mut session = TransferSession::new(name, size);
    let mut buf = vec![0u8; opts.chunk_size.max(1)];
    while !session.is_complete() {
        let want = session.next_read_len(buf.len());
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            // File shrank after the size was announced; the peer will see a short transfer.
            warn!(file = %session.file_name, sent = session.transferred(), announced = size, "file ended early");
            break;
        }
        with_timeout(opts.io_timeout, writer.write_all(&buf[..n])).await?;
        session.record(n);
    }
    with_timeout(opts.io_timeout, writer.shutdown()).await?;
    Ok(Some(session))
}

/// Fetch `file_name` from the transfer service at `addr` into `dest_dir/file_name`.
/// A short stream leaves the partial file in place and reports `TransferIncomplete`.
pub async fn fetch_file(
    addr: SocketAddr,
    file_name: &str,
    dest_dir: &Path,
    opts: TransferOptions,
) -> Result<TransferSession, TransferError> {
    if !is_plain_file_name(file_name) {
        return Err(TransferError::InvalidName(file_name.to_string()));
    }
    let request = encode_request(file_name)?;
    let stream = with_timeout(opts.io_timeout, TcpStream::connect(addr)).await?;
    debug!(%addr, file = file_name, "transfer connection established");
    let (reader, mut writer) = stream.into_split();
    with_timeout(opts.io_timeout, writer.write_all(request.as_bytes())).await?;

    let mut reader = BufReader::new(reader);
    let line = read_header_line(&mut reader, opts.io_timeout).await?;
    let size = match ResponseHeader::parse(&line)? {
        ResponseHeader::Size(n) => n,
        ResponseHeader::Error(Refusal::NotFound) => {
            return Err(TransferError::FileNotFound(file_name.to_string()))
        }
        ResponseHeader::Error(r) => return Err(TransferError::Remote(r)),
    };

    let path = dest_dir.join(file_name);
    let mut file = File::create(&path).await?;
    let mut session = TransferSession::new(file_name, size);
    let mut buf = vec![0u8; opts.chunk_size.max(1)];
    while !session.is_complete() {
        let want = session.next_read_len(buf.len());
        let n = with_timeout(opts.io_timeout, reader.read(&mut buf[..want])).await?;
        if n == 0 {
            file.flush().await?;
            return Err(TransferError::TransferIncomplete {
                path,
                received: session.transferred(),
                expected: size,
            });
        }
        file.write_all(&buf[..n]).await?;
        session.record(n);
    }
    file.flush().await?;
    info!(%addr, file = file_name, bytes = size, "file received");
    Ok(session)
}

/// Read one `\n`-terminated line of at most `MAX_HEADER_LEN` bytes. EOF also ends the line.
async fn read_header_line<R>(reader: &mut R, io_timeout: Duration) -> Result<String, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let mut limited = reader.take(MAX_HEADER_LEN as u64);
    let n = with_timeout(io_timeout, limited.read_until(b'\n', &mut raw)).await?;
    if n == 0 {
        return Err(TransferError::ConnectionClosed);
    }
    if !raw.ends_with(b"\n") && n == MAX_HEADER_LEN {
        return Err(TransferError::HeaderTooLong);
    }
    String::from_utf8(raw).map_err(|_| TransferError::Frame(FrameError::MalformedRequest))
}

/// Read the request. A `\n` ends it; so does a buffered, complete `REQUEST <name>` with no
/// terminator, which older clients send and then wait for the reply.
async fn read_request_line<R>(reader: &mut R, io_timeout: Duration) -> Result<String, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let buffered = with_timeout(io_timeout, reader.fill_buf()).await?;
        if buffered.is_empty() {
            break;
        }
        if let Some(end) = buffered.iter().position(|&b| b == b'\n') {
            raw.extend_from_slice(&buffered[..=end]);
            reader.consume(end + 1);
            break;
        }
        let n = buffered.len();
        raw.extend_from_slice(buffered);
        reader.consume(n);
        if raw.len() > MAX_HEADER_LEN {
            return Err(TransferError::HeaderTooLong);
        }
        if std::str::from_utf8(&raw).map_or(false, |s| parse_request(s).is_ok()) {
            break;
        }
    }
    if raw.is_empty() {
        return Err(TransferError::ConnectionClosed);
    }
    if raw.len() > MAX_HEADER_LEN {
        return Err(TransferError::HeaderTooLong);
    }
    String::from_utf8(raw).map_err(|_| TransferError::Frame(FrameError::MalformedRequest))
}

async fn send_header<W>(
    writer: &mut W,
    header: &ResponseHeader,
    opts: TransferOptions,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    with_timeout(opts.io_timeout, writer.write_all(header.encode().as_bytes())).await?;
    Ok(())
}

async fn with_timeout<F, T>(limit: Duration, fut: F) -> Result<T, TransferError>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(TransferError::Io),
        Err(_) => Err(TransferError::TimedOut(limit)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("peer stalled for {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("header line too long")]
    HeaderTooLong,
    #[error("connection closed before a header arrived")]
    ConnectionClosed,
    #[error("file {0:?} not found on the serving peer")]
    FileNotFound(String),
    #[error("serving peer refused the request: {0}")]
    Remote(Refusal),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("transfer incomplete: got {received} of {expected} bytes, partial file left at {}", path.display())]
    TransferIncomplete {
        path: PathBuf,
        received: u64,
        expected: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use fx_core::Directory;
    use rand::RngCore;

    fn fast() -> TransferOptions {
        TransferOptions {
            io_timeout: Duration::from_secs(2),
            chunk_size: 4096,
        }
    }

    async fn serve_dir(dir: &Path) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(PeerState {
            directory: Directory::new(),
            working_dir: dir.to_path_buf(),
        }));
        tokio::spawn(run_transfer_server(listener, state, fast()));
        addr
    }

    #[tokio::test]
    async fn fetched_file_is_byte_identical() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let mut content = vec![0u8; 100_003];
        rand::thread_rng().fill_bytes(&mut content);
        std::fs::write(src.path().join("report.txt"), &content).unwrap();

        let addr = serve_dir(src.path()).await;
        let session = fetch_file(addr, "report.txt", dst.path(), fast()).await.unwrap();
        assert_eq!(session.expected, content.len() as u64);
        assert_eq!(session.transferred(), content.len() as u64);
        assert_eq!(std::fs::read(dst.path().join("report.txt")).unwrap(), content);
    }

    #[tokio::test]
    async fn empty_file_transfers() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("empty"), b"").unwrap();
        let addr = serve_dir(src.path()).await;
        let session = fetch_file(addr, "empty", dst.path(), fast()).await.unwrap();
        assert_eq!(session.expected, 0);
        assert!(dst.path().join("empty").exists());
    }

    #[tokio::test]
    async fn wire_response_is_size_line_then_content() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let addr = serve_dir(src.path()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"REQUEST a.txt\n").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"5\nhello");
    }

    #[tokio::test]
    async fn unterminated_request_is_answered() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let addr = serve_dir(src.path()).await;

        // No newline and the write half stays open: the request is complete as sent.
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        writer.write_all(b"REQUEST a.txt").await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_to_end(&mut out))
            .await
            .expect("no reply to unterminated request")
            .unwrap();
        assert_eq!(out, b"5\nhello");
        drop(writer);
    }

    #[tokio::test]
    async fn missing_file_reports_not_found() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let addr = serve_dir(src.path()).await;
        let err = fetch_file(addr, "nope.txt", dst.path(), fast()).await.unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(ref n) if n == "nope.txt"));
        assert!(!dst.path().join("nope.txt").exists());
    }

    #[tokio::test]
    async fn directories_are_not_served() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        let addr = serve_dir(src.path()).await;
        let err = fetch_file(addr, "sub", dst.path(), fast()).await.unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn path_escapes_are_refused() {
        let src = tempfile::tempdir().unwrap();
        let addr = serve_dir(src.path()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"REQUEST ../secret\n").await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "ERROR bad-request\n");

        let dst = tempfile::tempdir().unwrap();
        let err = fetch_file(addr, "../secret", dst.path(), fast()).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidName(_)));
    }

    #[tokio::test]
    async fn short_stream_is_incomplete_and_leaves_partial_file() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = s.read(&mut buf).await.unwrap();
            s.write_all(b"10\nabcd").await.unwrap();
        });
        let dst = tempfile::tempdir().unwrap();
        let err = fetch_file(addr, "big.bin", dst.path(), fast()).await.unwrap_err();
        match err {
            TransferError::TransferIncomplete { received, expected, path } => {
                assert_eq!((received, expected), (4, 10));
                assert_eq!(std::fs::read(path).unwrap(), b"abcd");
            }
            other => panic!("expected TransferIncomplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(s);
        });
        let dst = tempfile::tempdir().unwrap();
        let opts = TransferOptions {
            io_timeout: Duration::from_millis(100),
            chunk_size: 1024,
        };
        let err = fetch_file(addr, "x", dst.path(), opts).await.unwrap_err();
        assert!(matches!(err, TransferError::TimedOut(_)));
    }

    #[tokio::test]
    async fn concurrent_requests_are_served_independently() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"aaaa").unwrap();
        let addr = serve_dir(src.path()).await;

        // A connection that never sends its request must not block others.
        let _stalled = TcpStream::connect(addr).await.unwrap();
        let dst = tempfile::tempdir().unwrap();
        let session = fetch_file(addr, "a.txt", dst.path(), fast()).await.unwrap();
        assert_eq!(session.transferred(), 4);
    }
}
