//! Turn-based transcript aggregation.
//!
//! Transcription fragments stream in while a turn is open; `close_turn`
//! turns whatever accumulated into immutable `Message`s, user first.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::ipc::events::{Message, Role};

#[derive(Debug, Default)]
pub struct TurnAggregator {
    inbound: String,
    outbound: String,
    seq: u64,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment of what the user said.
    pub fn append_inbound(&mut self, text: &str) {
        self.inbound.push_str(text);
    }

    /// Append a fragment of what the agent said.
    pub fn append_outbound(&mut self, text: &str) {
        self.outbound.push_str(text);
    }

    pub fn inbound(&self) -> &str {
        &self.inbound
    }

    pub fn outbound(&self) -> &str {
        &self.outbound
    }

    /// Flush the open turn, stamped with the current UTC time.
    pub fn close_turn(&mut self) -> Vec<Message> {
        self.close_turn_at(chrono::Utc::now().timestamp_millis())
    }

    /// Flush the open turn with an explicit timestamp (epoch milliseconds).
    /// Empty accumulators produce no message. Both are cleared either way.
    pub fn close_turn_at(&mut self, timestamp: i64) -> Vec<Message> {
        let mut flushed = Vec::with_capacity(2);
        let inbound = std::mem::take(&mut self.inbound);
        let outbound = std::mem::take(&mut self.outbound);

        for (text, sender) in [(inbound, Role::User), (outbound, Role::Agent)] {
            if text.is_empty() {
                continue;
            }
            let suffix = match sender {
                Role::User => 'u',
                Role::Agent => 'a',
            };
            flushed.push(Message {
                id: format!("{timestamp}-{}-{suffix}", self.seq),
                text,
                sender,
                timestamp,
            });
            self.seq += 1;
        }
        flushed
    }
}

/// Append-only, shareable list of finalised messages.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, messages: impl IntoIterator<Item = Message>) {
        self.messages.write().extend(messages);
    }

    /// Copy of the log as it is right now.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    pub fn last(&self) -> Option<Message> {
        self.messages.read().last().cloned()
    }
}
