//! In-memory chat history, per peer. Cleared when the process exits.

use std::time::SystemTime;

use bonjou_core::NodeId;
use dashmap::DashMap;
use std::sync::Arc;

/// Lines kept per peer before the oldest are dropped.
pub const HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone)]
pub struct ChatLine {
    pub direction: ChatDirection,
    pub peer_name: String,
    pub text: String,
    pub at: SystemTime,
}

#[derive(Clone, Default)]
pub struct MessageStore {
    lines: Arc<DashMap<NodeId, Vec<ChatLine>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: NodeId, peer_name: &str, direction: ChatDirection, text: &str) {
        let mut lines = self.lines.entry(peer).or_default();
        lines.push(ChatLine {
            direction,
            peer_name: peer_name.to_string(),
            text: text.to_string(),
            at: SystemTime::now(),
        });
        if lines.len() > HISTORY_LIMIT {
            let excess = lines.len() - HISTORY_LIMIT;
            lines.drain(..excess);
        }
    }

    /// History with one peer, oldest first.
    pub fn get(&self, peer: &NodeId) -> Vec<ChatLine> {
        self.lines
            .get(peer)
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Every line with every peer, oldest first.
    pub fn all(&self) -> Vec<(NodeId, ChatLine)> {
        let mut out: Vec<(NodeId, ChatLine)> = self
            .lines
            .iter()
            .flat_map(|entry| {
                let peer = *entry.key();
                entry
                    .value()
                    .iter()
                    .cloned()
                    .map(move |line| (peer, line))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by_key(|(_, line)| line.at);
        out
    }

    pub fn clear(&self) {
        self.lines.clear();
    }
}
