//! Per-session subscription index
//!
//! Filters are kept by exact string, plus two lookup structures keyed by
//! [`TopicHash`]: literal filters bucketed by hash, wildcard filters grouped
//! by `(hash, mask)`. A published topic only evaluates the filters whose
//! bucket survives the hash comparison.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use super::{is_match, TopicHash};
use crate::protocol::{QoS, SubscriptionOptions};

/// A subscription owned by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: Arc<str>,
    pub options: SubscriptionOptions,
    pub identifier: Option<u32>,
    pub hash: TopicHash,
}

impl Subscription {
    pub fn new(filter: &str, options: SubscriptionOptions, identifier: Option<u32>) -> Self {
        Self {
            filter: Arc::from(filter),
            options,
            identifier,
            hash: TopicHash::calculate(filter),
        }
    }
}

/// Consolidated result of every subscription of one session matching a topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionMatch {
    pub is_subscribed: bool,
    /// Highest matching subscription QoS, capped by the message QoS
    pub qos: QoS,
    pub retain_as_published: bool,
    pub subscription_identifiers: SmallVec<[u32; 4]>,
}

type Bucket = SmallVec<[Arc<str>; 2]>;

#[derive(Debug)]
pub struct SubscriptionIndex {
    client_id: Arc<str>,
    by_filter: AHashMap<Arc<str>, Subscription>,
    literal: AHashMap<u64, Bucket>,
    wildcard: AHashMap<(u64, u64), Bucket>,
}

impl SubscriptionIndex {
    pub fn new(client_id: Arc<str>) -> Self {
        Self {
            client_id,
            by_filter: AHashMap::new(),
            literal: AHashMap::new(),
            wildcard: AHashMap::new(),
        }
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    /// Insert or replace the subscription for its filter. Returns the
    /// previous subscription for the same filter, if any.
    pub fn insert(&mut self, subscription: Subscription) -> Option<Subscription> {
        let filter = subscription.filter.clone();
        let hash = subscription.hash;
        let previous = self.by_filter.insert(filter.clone(), subscription);
        if previous.is_none() {
            self.bucket_mut(&hash).push(filter);
        }
        previous
    }

    pub fn remove(&mut self, filter: &str) -> Option<Subscription> {
        let removed = self.by_filter.remove(filter)?;
        let hash = removed.hash;
        let bucket = self.bucket_mut(&hash);
        bucket.retain(|f| f.as_ref() != filter);
        if bucket.is_empty() {
            if hash.has_wildcard {
                self.wildcard.remove(&(hash.hash, hash.mask));
            } else {
                self.literal.remove(&hash.hash);
            }
        }
        Some(removed)
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.by_filter.get(filter)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.by_filter.contains_key(filter)
    }

    pub fn len(&self) -> usize {
        self.by_filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_filter.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.by_filter.values()
    }

    pub fn clear(&mut self) {
        self.by_filter.clear();
        self.literal.clear();
        self.wildcard.clear();
    }

    /// Evaluate every subscription of this session against a published topic.
    ///
    /// Subscriptions with `no_local` are skipped when `sender_client_id` is
    /// this session's own client id.
    pub fn check_subscriptions(
        &self,
        topic: &str,
        topic_hash: &TopicHash,
        message_qos: QoS,
        sender_client_id: Option<&str>,
    ) -> SubscriptionMatch {
        let own_message = sender_client_id == Some(self.client_id.as_ref());
        let mut result = SubscriptionMatch::default();
        let mut max_qos = QoS::AtMostOnce;

        let literal = self.literal.get(&topic_hash.hash).into_iter().flatten();
        let wildcard = self
            .wildcard
            .iter()
            .filter(|((hash, mask), _)| topic_hash.hash & mask == *hash)
            .flat_map(|(_, bucket)| bucket.iter());

        for filter in literal.chain(wildcard) {
            let Some(subscription) = self.by_filter.get(filter) else {
                continue;
            };
            if !is_match(topic, filter) {
                continue;
            }
            if subscription.options.no_local && own_message {
                continue;
            }

            result.is_subscribed = true;
            max_qos = max_qos.max(subscription.options.qos);
            result.retain_as_published |= subscription.options.retain_as_published;
            if let Some(id) = subscription.identifier {
                if !result.subscription_identifiers.contains(&id) {
                    result.subscription_identifiers.push(id);
                }
            }
        }

        result.qos = max_qos.min(message_qos);
        result
    }

    fn bucket_mut(&mut self, hash: &TopicHash) -> &mut Bucket {
        if hash.has_wildcard {
            self.wildcard.entry((hash.hash, hash.mask)).or_default()
        } else {
            self.literal.entry(hash.hash).or_default()
        }
    }
}
