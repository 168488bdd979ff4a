//! Everything the node surfaces to the user.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use bonjou_core::{JobId, NodeId};

use crate::peer::DepartReason;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerJoined {
        id: NodeId,
        name: String,
        address: SocketAddr,
    },
    PeerDeparted {
        id: NodeId,
        name: String,
        reason: DepartReason,
    },
    SessionOpened {
        peer: NodeId,
        name: String,
        address: SocketAddr,
    },
    SessionClosed {
        peer: NodeId,
        name: String,
        reason: String,
    },
    Chat {
        from: NodeId,
        name: String,
        text: String,
    },
    TransferOffered {
        job_id: JobId,
        from: NodeId,
        name: String,
        filename: String,
        total_size: u64,
    },
    TransferAccepted {
        job_id: JobId,
        filename: String,
    },
    TransferRejected {
        job_id: JobId,
        filename: String,
    },
    TransferCompleted {
        job_id: JobId,
        filename: String,
        /// Where the file landed, for inbound jobs.
        saved_to: Option<PathBuf>,
    },
    TransferFailed {
        job_id: JobId,
        filename: String,
        reason: String,
    },
    TransferCancelled {
        job_id: JobId,
        filename: String,
        by_peer: bool,
    },
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerJoined { id, name, address } => {
                write!(f, "* {name} ({}) joined from {address}", id.short())
            }
            Self::PeerDeparted { id, name, reason } => {
                let how = match reason {
                    DepartReason::Announced => "left",
                    DepartReason::Expired => "timed out",
                };
                write!(f, "* {name} ({}) {how}", id.short())
            }
            Self::SessionOpened { name, address, .. } => {
                write!(f, "* session with {name} open ({address})")
            }
            Self::SessionClosed { name, reason, .. } => {
                write!(f, "* session with {name} closed: {reason}")
            }
            Self::Chat { name, text, .. } => write!(f, "[{name}] {text}"),
            Self::TransferOffered {
                job_id,
                name,
                filename,
                total_size,
                ..
            } => write!(
                f,
                "* {name} offers {filename} ({total_size} bytes), job {}: @accept {} or @reject {}",
                job_id.short(),
                job_id.short(),
                job_id.short()
            ),
            Self::TransferAccepted { job_id, filename } => {
                write!(f, "* {filename} ({}) accepted, sending", job_id.short())
            }
            Self::TransferRejected { job_id, filename } => {
                write!(f, "* {filename} ({}) rejected", job_id.short())
            }
            Self::TransferCompleted {
                job_id,
                filename,
                saved_to,
            } => match saved_to {
                Some(path) => write!(
                    f,
                    "* {filename} ({}) received, saved to {}",
                    job_id.short(),
                    path.display()
                ),
                None => write!(f, "* {filename} ({}) delivered", job_id.short()),
            },
            Self::TransferFailed {
                job_id,
                filename,
                reason,
            } => write!(f, "* {filename} ({}) failed: {reason}", job_id.short()),
            Self::TransferCancelled {
                job_id,
                filename,
                by_peer,
            } => {
                let who = if *by_peer { "by peer" } else { "locally" };
                write!(f, "* {filename} ({}) cancelled {who}", job_id.short())
            }
        }
    }
}
