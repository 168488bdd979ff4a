//! bonjou-services: node state that outlives any single connection:
//! the peer registry, transfer jobs and their disk I/O, chat history, and
//! the events surfaced to the user.

pub mod events;
pub mod file_transfer;
pub mod message_store;
pub mod peer;

pub use events::NodeEvent;
pub use file_transfer::{
    FileSink, FileSource, TransferDirection, TransferError, TransferJob, TransferState,
};
pub use message_store::{ChatDirection, ChatLine, MessageStore};
pub use peer::{DepartReason, Peer, PeerEvent, PeerRegistry, PeerState, ResolveError, Upsert};
