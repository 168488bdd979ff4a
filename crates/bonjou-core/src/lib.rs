//! bonjou-core: shared types, wire formats, identity and configuration.
//! All other bonjou crates depend on this one.

pub mod config;
pub mod frame;
pub mod identity;
pub mod message;
pub mod transfer;
pub mod wire;

pub use config::{BonjouConfig, ConfigError};
pub use frame::{FrameCodec, FrameError};
pub use identity::{NodeId, NodeIdentity};
pub use message::{Message, MessageKind, Presence};
pub use transfer::{JobId, TransferAck, TransferChunk, TransferEnd, TransferOffer};
pub use wire::{Beacon, WireError};
