//! Retained message store
//!
//! One entry per topic behind a reader-writer lock: SUBSCRIBE replay and
//! fan-out read concurrently, a retained PUBLISH takes the write lock only
//! for the map update.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::protocol::ApplicationMessage;
use crate::topic::is_match;

/// A retained message plus the time it was stored, for expiry accounting
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub message: ApplicationMessage,
    pub stored_at: Instant,
}

impl RetainedMessage {
    pub fn new(message: ApplicationMessage) -> Self {
        Self {
            message,
            stored_at: Instant::now(),
        }
    }

    /// Remaining v5 message expiry, `Some(None)` for messages that never
    /// expire and `None` once expired.
    pub fn remaining_expiry(&self) -> Option<Option<u32>> {
        match self.message.properties.message_expiry_interval {
            None => Some(None),
            Some(interval) => {
                let elapsed = self.stored_at.elapsed().as_secs();
                (elapsed < u64::from(interval)).then(|| Some(interval - elapsed as u32))
            }
        }
    }
}

/// What a [`RetainedStore::set`] changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedUpdate {
    Stored,
    Replaced,
    Cleared,
    /// Empty payload for a topic without retained message
    Unchanged,
}

impl RetainedUpdate {
    pub fn is_change(self) -> bool {
        self != RetainedUpdate::Unchanged
    }
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: RwLock<AHashMap<Arc<str>, RetainedMessage>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the retained message for its topic. An empty payload
    /// removes the entry instead of storing an empty message.
    pub fn set(&self, message: &ApplicationMessage) -> RetainedUpdate {
        let mut messages = self.messages.write();
        if message.payload.is_empty() {
            return match messages.remove(&message.topic) {
                Some(_) => RetainedUpdate::Cleared,
                None => RetainedUpdate::Unchanged,
            };
        }

        let mut stored = message.clone();
        stored.retain = true;
        match messages.insert(message.topic.clone(), RetainedMessage::new(stored)) {
            Some(_) => RetainedUpdate::Replaced,
            None => RetainedUpdate::Stored,
        }
    }

    pub fn get(&self, topic: &str) -> Option<ApplicationMessage> {
        self.messages.read().get(topic).map(|r| r.message.clone())
    }

    pub fn get_all(&self) -> Vec<ApplicationMessage> {
        self.messages
            .read()
            .values()
            .map(|r| r.message.clone())
            .collect()
    }

    /// Retained messages whose topic matches `filter`, with their store time
    pub fn get_all_matching(&self, filter: &str) -> Vec<RetainedMessage> {
        self.messages
            .read()
            .iter()
            .filter(|(topic, _)| is_match(topic, filter))
            .map(|(_, retained)| retained.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Remove everything, returning how many entries were dropped
    pub fn clear(&self) -> usize {
        let mut messages = self.messages.write();
        let count = messages.len();
        messages.clear();
        count
    }

    /// Bulk load at startup, keeping the original store times. Empty
    /// payloads are skipped.
    pub fn load(&self, loaded: impl IntoIterator<Item = RetainedMessage>) -> usize {
        let mut messages = self.messages.write();
        let before = messages.len();
        for mut retained in loaded {
            if retained.message.payload.is_empty() {
                continue;
            }
            retained.message.retain = true;
            messages.insert(retained.message.topic.clone(), retained);
        }
        messages.len() - before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    #[test]
    fn test_empty_payload_is_a_tombstone() {
        let store = RetainedStore::new();
        let msg = ApplicationMessage::new("a/b", vec![1u8, 2, 3]).with_retain(true);
        assert_eq!(store.set(&msg), RetainedUpdate::Stored);
        assert_eq!(store.len(), 1);

        let clear = ApplicationMessage::new("a/b", Vec::<u8>::new()).with_retain(true);
        assert_eq!(store.set(&clear), RetainedUpdate::Cleared);
        assert!(store.get("a/b").is_none());
        assert!(store.get_all_matching("#").is_empty());
        assert_eq!(store.set(&clear), RetainedUpdate::Unchanged);
    }

    #[test]
    fn test_replace_keeps_latest() {
        let store = RetainedStore::new();
        store.set(&ApplicationMessage::new("t", "1").with_qos(QoS::AtLeastOnce));
        assert_eq!(store.set(&ApplicationMessage::new("t", "2")), RetainedUpdate::Replaced);
        let latest = store.get("t").unwrap();
        assert_eq!(&latest.payload[..], b"2");
        assert!(latest.retain);
    }

    #[test]
    fn test_get_all_matching() {
        let store = RetainedStore::new();
        for topic in ["home/kitchen/temp", "home/garage/temp", "office/temp", "$SYS/load"] {
            store.set(&ApplicationMessage::new(topic, "x"));
        }
        assert_eq!(store.get_all_matching("home/+/temp").len(), 2);
        assert_eq!(store.get_all_matching("#").len(), 3);
        assert_eq!(store.get_all_matching("$SYS/#").len(), 1);
    }

    #[test]
    fn test_expiry_accounting() {
        let mut msg = ApplicationMessage::new("t", "x");
        msg.properties.message_expiry_interval = Some(60);
        let retained = RetainedMessage::new(msg);
        assert!(matches!(retained.remaining_expiry(), Some(Some(s)) if s <= 60));

        let mut expired = ApplicationMessage::new("t", "x");
        expired.properties.message_expiry_interval = Some(0);
        assert_eq!(RetainedMessage::new(expired).remaining_expiry(), None);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let store = Arc::new(RetainedStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    store.set(&ApplicationMessage::new(format!("t/{}", i % 50), "x"));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        assert!(store.get_all_matching("t/#").len() <= 50);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.len(), 50);
    }
}
