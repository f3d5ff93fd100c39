// Line-oriented command shell over a registered agent.

use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;

use fx_core::Directory;
use fx_peer::{AgentEvent, PeerAgent};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "\
commands:
  setdir <path>            set the directory files are offered from and saved to
  offer <file>...          offer files from the working directory
  table                    show the peer directory
  list                     show offered files and their owners
  request <file> <peer>    fetch a file from a peer
  dereg                    leave the directory and exit
  disconnect               disconnect and exit
  help                     show this text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetDir(PathBuf),
    Offer(Vec<String>),
    Table,
    List,
    Request { file: String, peer: String },
    Dereg,
    Disconnect,
    Help,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command {0:?} (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one input line. The keyword is case-insensitive; arguments are taken as typed.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut tokens = line.split_whitespace();
    let Some(keyword) = tokens.next() else {
        return Ok(Command::Empty);
    };
    let args: Vec<&str> = tokens.collect();
    let cmd = match keyword.to_ascii_lowercase().as_str() {
        "setdir" => match args.as_slice() {
            [path] => Command::SetDir(PathBuf::from(path)),
            _ => return Err(ParseError::Usage("setdir <path>")),
        },
        "offer" if !args.is_empty() => Command::Offer(args.iter().map(|s| s.to_string()).collect()),
        "offer" => return Err(ParseError::Usage("offer <file>...")),
        "request" => match args.as_slice() {
            [file, peer] => Command::Request {
                file: file.to_string(),
                peer: peer.to_string(),
            },
            _ => return Err(ParseError::Usage("request <file> <peer>")),
        },
        "table" => Command::Table,
        "list" => Command::List,
        "dereg" => Command::Dereg,
        "disconnect" => Command::Disconnect,
        "help" | "?" => Command::Help,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(cmd)
}

pub fn format_table(dir: &Directory) -> String {
    if dir.is_empty() {
        return "(directory is empty)".to_string();
    }
    let mut out = format!(
        "{:<16} {:<40} {:>7} {:>8} {:<7} FILES",
        "IDENTITY", "ADDRESS", "CONTROL", "TRANSFER", "STATUS"
    );
    for r in dir.iter() {
        out.push_str(&format!(
            "\n{:<16} {:<40} {:>7} {:>8} {:<7} {}",
            r.identity,
            r.address,
            r.control_port,
            r.transfer_port,
            if r.online { "online" } else { "offline" },
            r.files().join(" ")
        ));
    }
    out
}

pub fn format_listing(dir: &Directory) -> String {
    let files = dir.offered_files();
    if files.is_empty() {
        return "(no files offered)".to_string();
    }
    let mut out = format!("{:<32} OWNER", "FILE");
    for (file, owner) in files {
        out.push_str(&format!("\n{file:<32} {owner}"));
    }
    out
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Run until `dereg`, `disconnect`, end of input or Ctrl+C.
pub async fn run(agent: PeerAgent, events: mpsc::UnboundedReceiver<AgentEvent>) -> anyhow::Result<()> {
    drive(
        agent,
        events,
        BufReader::new(tokio::io::stdin()),
        tokio::signal::ctrl_c(),
    )
    .await
}

/// Command loop over `input`. `interrupt` is subscribed once and raced against every command,
/// so a stalled request or a retrying offer never holds off a silent disconnect.
async fn drive<R, I>(
    agent: PeerAgent,
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    input: R,
    interrupt: I,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = io::Result<()>>,
{
    tokio::pin!(interrupt);
    let mut lines = input.lines();
    println!("registered as {}; type `help` for commands", agent.identity());
    prompt();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    agent.disconnect(false).await;
                    return Ok(());
                };
                let cmd = match parse(&line) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        println!("{e}");
                        prompt();
                        continue;
                    }
                };
                match cmd {
                    Command::Dereg => {
                        // Interrupted: dropping the agent stops its tasks without a goodbye.
                        tokio::select! {
                            res = agent.deregister() => match res {
                                Ok(_) => println!("deregistered"),
                                Err(e) => println!("deregistration not confirmed: {e}"),
                            },
                            res = &mut interrupt => {
                                res?;
                                println!();
                            }
                        }
                        return Ok(());
                    }
                    Command::Disconnect => {
                        agent.disconnect(false).await;
                        println!("disconnected");
                        return Ok(());
                    }
                    other => {
                        tokio::select! {
                            _ = execute(&agent, other) => {}
                            res = &mut interrupt => {
                                res?;
                                println!();
                                agent.disconnect(true).await;
                                return Ok(());
                            }
                        }
                    }
                }
                prompt();
            }
            Some(event) = events.recv() => {
                match event {
                    AgentEvent::DirectoryChanged => {
                        println!("\ndirectory updated:\n{}", format_table(&agent.directory().await));
                    }
                    AgentEvent::Disconnected { identity } => {
                        println!("\nserver lists {identity} as offline");
                    }
                }
                prompt();
            }
            res = &mut interrupt => {
                res?;
                println!();
                agent.disconnect(true).await;
                return Ok(());
            }
        }
    }
}

async fn execute(agent: &PeerAgent, cmd: Command) {
    match cmd {
        Command::SetDir(path) => match agent.set_working_dir(&path).await {
            Ok(dir) => println!("working directory: {}", dir.display()),
            Err(e) => println!("{e}"),
        },
        Command::Offer(names) => match agent.offer(&names).await {
            Ok(sent) => println!("offered: {}", sent.join(" ")),
            Err(e) => println!("offer failed: {e}"),
        },
        Command::Table => println!("{}", format_table(&agent.directory().await)),
        Command::List => println!("{}", format_listing(&agent.directory().await)),
        Command::Request { file, peer } => match agent.request_file(&file, &peer).await {
            Ok(session) => println!("received {} ({} bytes)", session.file_name, session.transferred()),
            Err(e) => println!("request failed: {e}"),
        },
        Command::Help => println!("{HELP}"),
        Command::Empty | Command::Dereg | Command::Disconnect => {}
    }
}
