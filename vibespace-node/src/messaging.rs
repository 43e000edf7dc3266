//! Per-channel chat history. Append-only, receipt order, no dedup.

use std::collections::HashMap;

use vibespace_core::{ChannelId, Message};

#[derive(Debug, Default)]
pub struct MessageLog {
    channels: HashMap<ChannelId, Vec<Message>>,
    sequence: u64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a message authored locally. Ids are `<timestamp_ms>-<seq>`.
    pub fn compose(&mut self, author: &str, avatar: &str, content: &str, now_ms: u64) -> Message {
        self.sequence += 1;
        Message {
            id: format!("{}-{}", now_ms, self.sequence),
            author: author.to_owned(),
            avatar: avatar.to_owned(),
            content: content.to_owned(),
            timestamp_ms: now_ms,
        }
    }

    pub fn append(&mut self, channel_id: &str, message: Message) {
        self.channels
            .entry(channel_id.to_owned())
            .or_default()
            .push(message);
    }

    pub fn channel(&self, channel_id: &str) -> &[Message] {
        self.channels
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
