//! Id-keyed stores for channels and handlers
//!
//! Semantic containers with O(1) get/set/remove and unordered
//! enumeration. Writes are not atomic across stores; the runtime updates
//! dependent stores in a fixed order on register, forget, and clear.

use dashmap::DashMap;
use std::sync::Arc;

use crate::channel::Channel;
use crate::types::Handler;

/// Channel and handler stores
#[derive(Default)]
pub struct Stores {
    channels: DashMap<String, Arc<Channel>>,
    handlers: DashMap<String, Handler>,
}

impl Stores {
    /// Empty stores
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a channel; returns the previous record, if any
    pub fn insert_channel(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.channels.insert(channel.config.id.clone(), channel)
    }

    /// Fetch a channel
    pub fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a channel
    pub fn remove_channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.remove(id).map(|(_, channel)| channel)
    }

    /// Whether a channel exists
    pub fn has_channel(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// Snapshot of all channel ids
    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all channels
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of registered channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Insert or replace a handler (at most one per channel id)
    pub fn insert_handler(&self, id: &str, handler: Handler) -> bool {
        self.handlers.insert(id.to_string(), handler).is_some()
    }

    /// Fetch a handler
    pub fn handler(&self, id: &str) -> Option<Handler> {
        self.handlers.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a handler
    pub fn remove_handler(&self, id: &str) -> bool {
        self.handlers.remove(id).is_some()
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Drop every channel and handler
    pub fn clear(&self) {
        self.channels.clear();
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::pipeline::compile;
    use crate::types::HandlerOutcome;

    #[test]
    fn channel_insert_replace_remove() {
        let stores = Stores::new();
        let channel = Arc::new(compile(ChannelConfig::new("ch")).unwrap());
        assert!(stores.insert_channel(channel.clone()).is_none());
        assert!(stores.insert_channel(channel).is_some());
        assert!(stores.has_channel("ch"));
        assert_eq!(stores.channel_count(), 1);
        assert!(stores.remove_channel("ch").is_some());
        assert!(!stores.has_channel("ch"));
    }

    #[test]
    fn handler_registration_replaces() {
        let stores = Stores::new();
        let handler: Handler = Arc::new(|_| Box::pin(async { Ok(HandlerOutcome::Done) }));
        assert!(!stores.insert_handler("ch", handler.clone()));
        assert!(stores.insert_handler("ch", handler));
        assert_eq!(stores.handler_count(), 1);
        assert!(stores.remove_handler("ch"));
        assert!(!stores.remove_handler("ch"));
    }
}
