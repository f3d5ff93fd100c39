//! Load peer config from file and environment.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fx_core::reliability::{DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS};
use fx_core::transfer::DEFAULT_CHUNK_SIZE;
use fx_core::RetryPolicy;
use serde::Deserialize;
use tracing::warn;

use crate::transfer::TransferOptions;

/// Peer configuration. File: ~/.config/fxchange/peer.toml or /etc/fxchange/peer.toml.
/// Env overrides: FXCHANGE_PEER_SERVER, FXCHANGE_PEER_CONTROL_PORT, FXCHANGE_PEER_TRANSFER_PORT,
/// FXCHANGE_PEER_SHARE_DIR, FXCHANGE_PEER_MAX_ATTEMPTS, FXCHANGE_PEER_ATTEMPT_TIMEOUT_MS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Identity to register under. Usually given on the command line.
    #[serde(default)]
    pub identity: Option<String>,
    /// Rendezvous server, host:port (default 127.0.0.1:7400).
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Local bind address for both sockets (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Control-plane UDP port (default 7401; 0 picks a free port).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Transfer TCP port (default 7402; 0 picks a free port).
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    /// Address advertised to the server. Detected from the route to the server when unset.
    #[serde(default)]
    pub advertise_addr: Option<IpAddr>,
    /// Directory offered files are read from and fetched files written to (default: current dir).
    #[serde(default)]
    pub share_dir: Option<PathBuf>,
    /// Total sends for OFFER and DEREG (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait for ACK per send, milliseconds (default 500).
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Wait for WELCOME/ERROR after REGISTER, milliseconds (default 2000).
    #[serde(default = "default_register_timeout_ms")]
    pub register_timeout_ms: u64,
    /// Bound on connect and each read/write of a transfer, milliseconds (default 10000).
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Transfer streaming unit in bytes (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_server_addr() -> String {
    "127.0.0.1:7400".to_string()
}
fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_control_port() -> u16 {
    7401
}
fn default_transfer_port() -> u16 {
    7402
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_attempt_timeout_ms() -> u64 {
    DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64
}
fn default_register_timeout_ms() -> u64 {
    2000
}
fn default_io_timeout_ms() -> u64 {
    10_000
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            identity: None,
            server_addr: default_server_addr(),
            bind_addr: default_bind_addr(),
            control_port: default_control_port(),
            transfer_port: default_transfer_port(),
            advertise_addr: None,
            share_dir: None,
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            register_timeout_ms: default_register_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl PeerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            chunk_size: self.chunk_size.max(1),
        }
    }
}

/// Load config: explicit file if given, else the first standard path that exists, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<PeerConfig, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_from(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Parse one TOML file.
pub fn load_from(path: &Path) -> Result<PeerConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut PeerConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("FXCHANGE_PEER_SERVER") {
        c.server_addr = s;
    }
    if let Some(s) = var("FXCHANGE_PEER_SHARE_DIR") {
        c.share_dir = Some(PathBuf::from(s));
    }
    parse_env(&var, "FXCHANGE_PEER_CONTROL_PORT", &mut c.control_port);
    parse_env(&var, "FXCHANGE_PEER_TRANSFER_PORT", &mut c.transfer_port);
    parse_env(&var, "FXCHANGE_PEER_MAX_ATTEMPTS", &mut c.max_attempts);
    parse_env(&var, "FXCHANGE_PEER_ATTEMPT_TIMEOUT_MS", &mut c.attempt_timeout_ms);
}

fn parse_env<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(s) = var(key) {
        match s.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %s, "ignoring invalid environment override"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fxchange/peer.toml"));
    }
    out.push(PathBuf::from("/etc/fxchange/peer.toml"));
    out
}

fn load_file() -> Option<PeerConfig> {
    for p in config_paths() {
        if p.exists() {
            match load_from(&p) {
                Ok(c) => return Some(c),
                Err(e) => warn!(error = %e, "falling back to default config"),
            }
            break;
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_reliability_defaults() {
        let c = PeerConfig::default();
        assert_eq!(c.retry_policy(), RetryPolicy::default());
        assert_eq!(c.transfer_options().chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.toml");
        std::fs::write(
            &path,
            "identity = \"alice\"\nserver_addr = \"10.0.0.1:9000\"\nmax_attempts = 5\nattempt_timeout_ms = 250\nadvertise_addr = \"10.0.0.2\"\n",
        )
        .unwrap();
        let c = load_from(&path).unwrap();
        assert_eq!(c.identity.as_deref(), Some("alice"));
        assert_eq!(c.server_addr, "10.0.0.1:9000");
        assert_eq!(
            c.retry_policy(),
            RetryPolicy {
                max_attempts: 5,
                attempt_timeout: Duration::from_millis(250)
            }
        );
        assert_eq!(c.advertise_addr, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(c.control_port, 7401);
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.toml");
        std::fs::write(&path, "retries = 4\n").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FXCHANGE_PEER_SERVER", "server.lan:7400"),
            ("FXCHANGE_PEER_TRANSFER_PORT", "8123"),
            ("FXCHANGE_PEER_MAX_ATTEMPTS", "many"),
            ("FXCHANGE_PEER_SHARE_DIR", "/srv/share"),
        ]
        .into();
        let mut c = PeerConfig::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.server_addr, "server.lan:7400");
        assert_eq!(c.transfer_port, 8123);
        assert_eq!(c.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(c.share_dir, Some(PathBuf::from("/srv/share")));
    }
}
