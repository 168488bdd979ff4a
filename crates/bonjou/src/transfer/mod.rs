//! File transfers over message sessions.

pub mod manager;
pub mod send_worker;

pub use manager::TransferManager;
