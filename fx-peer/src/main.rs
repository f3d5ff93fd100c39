// fxchange peer: register with the rendezvous server, then drive the agent from an interactive shell.

mod shell;

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use fx_peer::{config, AgentError, PeerAgent};

#[derive(Parser, Debug)]
#[command(name = "fx-peer", version, about = "fxchange peer")]
struct Cli {
    /// Identity to register under (overrides config)
    identity: Option<String>,

    /// Rendezvous server host:port (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Control-plane UDP port, 0 for any
    #[arg(long)]
    control_port: Option<u16>,

    /// Transfer TCP port, 0 for any
    #[arg(long)]
    transfer_port: Option<u16>,

    /// Local bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Address advertised to the server (default: detected)
    #[arg(long)]
    advertise: Option<IpAddr>,

    /// Working directory for offered and fetched files
    #[arg(long)]
    share_dir: Option<PathBuf>,

    /// Config file (default: ~/.config/fxchange/peer.toml, then /etc/fxchange/peer.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Set log level: error,warn,info,debug,trace
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the shell
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref()).context("loading peer config")?;
    if let Some(s) = cli.server {
        cfg.server_addr = s;
    }
    if let Some(p) = cli.control_port {
        cfg.control_port = p;
    }
    if let Some(p) = cli.transfer_port {
        cfg.transfer_port = p;
    }
    if let Some(a) = cli.bind {
        cfg.bind_addr = a;
    }
    if cli.advertise.is_some() {
        cfg.advertise_addr = cli.advertise;
    }
    if cli.share_dir.is_some() {
        cfg.share_dir = cli.share_dir;
    }
    let identity = cli
        .identity
        .or_else(|| cfg.identity.clone())
        .context("no identity given (argument or `identity` in config)")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (mut agent, events) = PeerAgent::bind(&identity, &cfg)
            .await
            .context("starting peer agent")?;
        match agent.register().await {
            Ok(()) => {}
            Err(AgentError::Conflict(id)) => {
                anyhow::bail!("identity {id:?} is already online; choose another")
            }
            Err(e) => return Err(e).context("registering with server"),
        }
        shell::run(agent, events).await
    })
}
