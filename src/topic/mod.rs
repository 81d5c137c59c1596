//! Topic names, filters and subscription matching
//!
//! - [`is_match`]: lock-step level matching with `+`/`#` wildcards
//! - [`TopicHash`]: fixed-width structural hash used to bucket filters
//! - [`SubscriptionIndex`]: one session's subscriptions, queried per publish

mod hash;
mod index;
mod matcher;
pub mod validation;

pub use hash::TopicHash;
pub use index::{Subscription, SubscriptionIndex, SubscriptionMatch};
pub use matcher::is_match;
pub use validation::{
    has_wildcard, is_shared_subscription, validate_topic_filter, validate_topic_name,
};
