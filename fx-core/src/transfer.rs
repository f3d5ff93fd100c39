//! Transfer-plane framing: request line, tagged response header, per-connection session state.
//!
//! Request:  `REQUEST <fileName>\n`
//! Response: `<decimal size>\n` followed by exactly `size` raw bytes, or `ERROR <reason>\n`.
//! The size line is digits only, so an error line can never be read as a size.

use std::fmt;

use crate::protocol::{validate_name, NameError};

pub const REQUEST_KEYWORD: &str = "REQUEST";

/// Header lines (request or response) longer than this are rejected.
pub const MAX_HEADER_LEN: usize = 1024;

/// Default read/write unit when streaming file content.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A name that resolves to a file directly inside the serving directory.
pub fn is_plain_file_name(name: &str) -> bool {
    validate_name(name).is_ok()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

/// Build the request line for `file_name`.
pub fn encode_request(file_name: &str) -> Result<String, FrameError> {
    validate_name(file_name)?;
    Ok(format!("{REQUEST_KEYWORD} {file_name}\n"))
}

/// Parse a request line (terminator optional). Returns the requested file name.
pub fn parse_request(line: &str) -> Result<String, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (keyword, name) = line.split_once(' ').ok_or(FrameError::MalformedRequest)?;
    if keyword != REQUEST_KEYWORD {
        return Err(FrameError::MalformedRequest);
    }
    validate_name(name)?;
    Ok(name.to_string())
}

/// Why a serving peer refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    NotFound,
    BadRequest,
    Other(String),
}

impl Refusal {
    fn token(&self) -> &str {
        match self {
            Refusal::NotFound => "not-found",
            Refusal::BadRequest => "bad-request",
            Refusal::Other(s) => s,
        }
    }

    fn from_token(token: &str) -> Self {
        match token {
            "not-found" => Refusal::NotFound,
            "bad-request" => Refusal::BadRequest,
            other => Refusal::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// First line of a transfer response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHeader {
    Size(u64),
    Error(Refusal),
}

impl ResponseHeader {
    pub fn encode(&self) -> String {
        match self {
            ResponseHeader::Size(n) => format!("{n}\n"),
            ResponseHeader::Error(r) => format!("ERROR {}\n", r.token()),
        }
    }

    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "ERROR" {
            return Ok(ResponseHeader::Error(Refusal::Other(String::new())));
        }
        if let Some(reason) = line.strip_prefix("ERROR ") {
            return Ok(ResponseHeader::Error(Refusal::from_token(reason.trim())));
        }
        if line.is_empty() || !line.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::MalformedHeader(line.to_string()));
        }
        line.parse()
            .map(ResponseHeader::Size)
            .map_err(|_| FrameError::MalformedHeader(line.to_string()))
    }
}

/// One file transfer over one connection: name, announced size, bytes moved so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub file_name: String,
    pub expected: u64,
    transferred: u64,
}

impl TransferSession {
    pub fn new(file_name: impl Into<String>, expected: u64) -> Self {
        Self {
            file_name: file_name.into(),
            expected,
            transferred: 0,
        }
    }

    /// Record `n` more bytes moved.
    pub fn record(&mut self, n: usize) {
        self.transferred = self.transferred.saturating_add(n as u64);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn remaining(&self) -> u64 {
        self.expected.saturating_sub(self.transferred)
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.expected
    }

    /// Next read size: never past the announced end.
    pub fn next_read_len(&self, chunk_size: usize) -> usize {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        remaining.min(chunk_size.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed request line")]
    MalformedRequest,
    #[error("malformed response header {0:?}")]
    MalformedHeader(String),
    #[error("invalid file name: {0}")]
    InvalidName(#[from] NameError),
}
