// fxchange rendezvous server: directory owner and broadcaster.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use fx_server::{config, RegistryServer};

#[derive(Parser, Debug)]
#[command(name = "fx-server", version, about = "fxchange rendezvous server")]
struct Cli {
    /// Control-plane UDP port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(long)]
    bind: Option<std::net::IpAddr>,

    /// Config file (default: ~/.config/fxchange/server.toml, then /etc/fxchange/server.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Set log level: error,warn,info,debug,trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let mut cfg = config::load(cli.config.as_deref()).context("loading server config")?;
    if let Some(p) = cli.port {
        cfg.port = p;
    }
    if let Some(a) = cli.bind {
        cfg.bind_addr = a;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let bind = SocketAddr::new(cfg.bind_addr, cfg.port);
        let server = RegistryServer::bind(bind)
            .await
            .with_context(|| format!("binding {bind}"))?;
        tokio::select! {
            res = server.run() => res.context("registry server stopped")?,
            res = shutdown_signal() => {
                res?;
                tracing::info!("shutting down");
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
