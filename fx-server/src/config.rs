//! Load server config from file and environment.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Server configuration. File: ~/.config/fxchange/server.toml or /etc/fxchange/server.toml.
/// Env overrides: FXCHANGE_SERVER_PORT, FXCHANGE_SERVER_BIND.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Control-plane UDP port (default 7400).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
}

fn default_port() -> u16 {
    7400
}
fn default_bind_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
        }
    }
}

/// Load config: explicit file if given, else the first standard path that exists, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_from(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Parse one TOML file.
pub fn load_from(path: &Path) -> Result<ServerConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("FXCHANGE_SERVER_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring invalid FXCHANGE_SERVER_PORT"),
        }
    }
    if let Some(s) = var("FXCHANGE_SERVER_BIND") {
        match s.parse::<IpAddr>() {
            Ok(a) => c.bind_addr = a,
            Err(_) => warn!(value = %s, "ignoring invalid FXCHANGE_SERVER_BIND"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fxchange/server.toml"));
    }
    out.push(PathBuf::from("/etc/fxchange/server.toml"));
    out
}

fn load_file() -> Option<ServerConfig> {
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
