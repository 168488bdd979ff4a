//! bonjou: LAN chat and file transfer.
//!
//! Peers find each other with UDP beacons, then talk over one TCP session
//! per pair carrying chat lines and chunked file transfers.

pub mod discovery;
pub mod dispatch;
pub mod node;
pub mod session;
pub mod transfer;

pub use discovery::DiscoveryState;
pub use dispatch::{Command, CommandDispatcher, CommandError, Outcome};
pub use node::{Node, NodeError};
pub use session::{MessageSession, SessionError};
pub use transfer::TransferManager;
