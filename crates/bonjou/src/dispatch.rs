//! Maps `@command` input lines onto node operations.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use bonjou_services::{ChatDirection, TransferDirection};

use crate::node::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Peers,
    Send { target: String, text: String },
    Broadcast { text: String },
    File { target: String, path: PathBuf },
    Accept(String),
    Reject(String),
    Cancel(String),
    Transfers,
    History(Option<String>),
    Connect(String),
    Disconnect(String),
    Exit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?}, try @help")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// What the input loop should do after a line.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    Exit,
}

const HELP: &str = "\
commands:
  @peers                  list discovered peers (alias @users)
  @send <peer> <text>     send a chat line
  @broadcast <text>       chat to every peer
  @file <peer> <path>     offer a file
  @accept <job>           accept an incoming file
  @reject <job>           reject an incoming file
  @cancel <job>           cancel a transfer
  @transfers              list transfers
  @history [peer]         chat history
  @connect <peer>         open a session
  @disconnect <peer>      close a session
  @exit                   leave (alias @quit)
peers are named by display name, id prefix or ip[:port]; jobs by id prefix";

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

impl std::str::FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(body) = line.strip_prefix('@') else {
            return Err(CommandError::Unknown(line.to_string()));
        };
        let (name, rest) = split_word(body);
        let one = |usage| {
            let (arg, extra) = split_word(rest);
            if arg.is_empty() || !extra.is_empty() {
                Err(CommandError::Usage(usage))
            } else {
                Ok(arg.to_string())
            }
        };

        match name.to_ascii_lowercase().as_str() {
            "help" => Ok(Self::Help),
            "peers" | "users" => Ok(Self::Peers),
            "send" => match split_word(rest) {
                (target, text) if !target.is_empty() && !text.is_empty() => Ok(Self::Send {
                    target: target.to_string(),
                    text: text.to_string(),
                }),
                _ => Err(CommandError::Usage("@send <peer> <text>")),
            },
            "broadcast" if !rest.is_empty() => Ok(Self::Broadcast { text: rest.to_string() }),
            "broadcast" => Err(CommandError::Usage("@broadcast <text>")),
            "file" => match split_word(rest) {
                (target, path) if !target.is_empty() && !path.is_empty() => Ok(Self::File {
                    target: target.to_string(),
                    path: PathBuf::from(path),
                }),
                _ => Err(CommandError::Usage("@file <peer> <path>")),
            },
            "accept" => one("@accept <job>").map(Self::Accept),
            "reject" => one("@reject <job>").map(Self::Reject),
            "cancel" => one("@cancel <job>").map(Self::Cancel),
            "transfers" => Ok(Self::Transfers),
            "history" => match split_word(rest) {
                ("", _) => Ok(Self::History(None)),
                (peer, "") => Ok(Self::History(Some(peer.to_string()))),
                _ => Err(CommandError::Usage("@history [peer]")),
            },
            "connect" => one("@connect <peer>").map(Self::Connect),
            "disconnect" => one("@disconnect <peer>").map(Self::Disconnect),
            "exit" | "quit" => Ok(Self::Exit),
            _ => Err(CommandError::Unknown(line.to_string())),
        }
    }
}

pub struct CommandDispatcher {
    node: Arc<Node>,
}

impl CommandDispatcher {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// Run one input line. Errors become replies; only `@exit` ends the loop,
    /// after the node has shut down.
    pub async fn dispatch(&self, line: &str) -> Outcome {
        let command = match line.parse::<Command>() {
            Ok(c) => c,
            Err(e) => return Outcome::Reply(e.to_string()),
        };
        tracing::debug!(?command, "dispatching");

        if command == Command::Exit {
            self.node.shutdown().await;
            return Outcome::Exit;
        }
        match self.run(command).await {
            Ok(reply) => Outcome::Reply(reply),
            Err(e) => Outcome::Reply(format!("error: {e}")),
        }
    }

    async fn run(&self, command: Command) -> Result<String, crate::node::NodeError> {
        let node = &self.node;
        let reply = match command {
            Command::Help => HELP.to_string(),
            Command::Peers => self.peers(),
            Command::Send { target, text } => {
                let session = node.send_chat(&target, &text).await?;
                format!("-> {}: {text}", session.peer_name)
            }
            Command::Broadcast { text } => {
                let results = node.broadcast_chat(&text).await?;
                if results.is_empty() {
                    return Ok("no peers to broadcast to".to_string());
                }
                let mut out = String::new();
                for (peer, result) in results {
                    match result {
                        Ok(()) => {
                            let _ = writeln!(out, "-> {}: {text}", peer.display_name);
                        }
                        Err(e) => {
                            let _ = writeln!(out, "!! {}: {e}", peer.display_name);
                        }
                    }
                }
                out.trim_end().to_string()
            }
            Command::File { target, path } => {
                let job = node.send_file(&target, &path).await?;
                format!(
                    "offered {} ({} bytes) to {} as job {}",
                    job.filename,
                    job.total_size,
                    job.peer_name,
                    job.job_id.short()
                )
            }
            Command::Accept(job) => {
                let job = node.accept(&job).await?;
                format!("accepted {} from {} (job {})", job.filename, job.peer_name, job.job_id.short())
            }
            Command::Reject(job) => {
                let job = node.reject(&job).await?;
                format!("rejected {} from {}", job.filename, job.peer_name)
            }
            Command::Cancel(job) => {
                let job = node.cancel(&job).await?;
                format!("cancelled {} (job {})", job.filename, job.job_id.short())
            }
            Command::Transfers => self.transfers().await,
            Command::History(target) => self.history(target.as_deref())?,
            Command::Connect(target) => {
                let session = node.connect(&target).await?;
                format!("connected to {} at {}", session.peer_name, session.peer_addr)
            }
            Command::Disconnect(target) => {
                if node.disconnect(&target).await? {
                    format!("disconnected from {target}")
                } else {
                    format!("no open session with {target}")
                }
            }
            Command::Exit => String::new(),
        };
        Ok(reply)
    }

    fn peers(&self) -> String {
        let peers = self.node.peers();
        if peers.is_empty() {
            return "no peers discovered yet".to_string();
        }
        let mut out = format!("{} peer(s):", peers.len());
        for p in peers {
            let _ = write!(
                out,
                "\n  {}  {:<20} {:<22} {}s ago",
                p.id.short(),
                p.display_name,
                p.address,
                p.last_seen_at.elapsed().as_secs()
            );
        }
        out
    }

    async fn transfers(&self) -> String {
        let jobs = self.node.transfers().await;
        if jobs.is_empty() {
            return "no transfers".to_string();
        }
        let mut out = String::from("transfers:");
        for job in jobs {
            let (done, total) = job.progress();
            let arrow = match job.direction {
                TransferDirection::Outbound => "->",
                TransferDirection::Inbound => "<-",
            };
            let _ = write!(
                out,
                "\n  {}  {arrow} {:<16} {:<24} {:<11} {done}/{total} chunks",
                job.job_id.short(),
                job.peer_name,
                job.filename,
                job.state.to_string(),
            );
            if let Some(reason) = &job.failure {
                let _ = write!(out, " ({reason})");
            }
        }
        out
    }

    fn history(&self, target: Option<&str>) -> Result<String, crate::node::NodeError> {
        let lines = self.node.history(target)?;
        if lines.is_empty() {
            return Ok("no chat history".to_string());
        }
        let mut out = String::new();
        for (_, line) in lines {
            let _ = match line.direction {
                ChatDirection::Incoming => writeln!(out, "[{}] {}", line.peer_name, line.text),
                ChatDirection::Outgoing => writeln!(out, "-> {}: {}", line.peer_name, line.text),
            };
        }
        Ok(out.trim_end().to_string())
    }
}
