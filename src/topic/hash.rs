//! Structural topic hash
//!
//! Each of the first eight levels of a topic contributes one byte of a `u64`.
//! Wildcard levels in a filter are masked out, so a filter can be checked
//! against a topic with a single `and` + compare. The hash only narrows the
//! candidates; every candidate is confirmed with [`is_match`].
//!
//! [`is_match`]: super::is_match

const HASHED_LEVELS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TopicHash {
    /// One checksum byte per level, first level in the most significant byte
    pub hash: u64,
    /// 0xFF for literal levels, 0x00 for wildcard levels
    pub mask: u64,
    pub has_wildcard: bool,
}

impl TopicHash {
    pub fn calculate(topic: &str) -> Self {
        let bytes = topic.as_bytes();
        let mut hash = 0u64;
        let mut wildcard_levels = 0u64;
        let mut checksum = 0u8;
        let mut level_wildcard = 0u8;
        let mut fill = 0u8;
        let mut has_wildcard = false;
        let mut levels = 0u32;
        let mut pos = 0;

        while pos < bytes.len() {
            match bytes[pos] {
                b'/' => {
                    hash = (hash << 8) | u64::from(checksum);
                    wildcard_levels = (wildcard_levels << 8) | u64::from(level_wildcard);
                    checksum = 0;
                    level_wildcard = 0;
                    levels += 1;
                    if levels == HASHED_LEVELS {
                        break;
                    }
                }
                b'+' => {
                    level_wildcard = 0xFF;
                    has_wildcard = true;
                }
                b'#' => {
                    // Covers this level and every level after it
                    level_wildcard = 0xFF;
                    fill = 0xFF;
                    has_wildcard = true;
                    break;
                }
                b if b & 1 == 0 => checksum = checksum.wrapping_add(b),
                b => checksum ^= b >> 1,
            }
            pos += 1;
        }

        if levels < HASHED_LEVELS {
            hash = (hash << 8) | u64::from(checksum);
            wildcard_levels = (wildcard_levels << 8) | u64::from(level_wildcard);
            levels += 1;
            while levels < HASHED_LEVELS {
                hash <<= 8;
                wildcard_levels = (wildcard_levels << 8) | u64::from(fill);
                levels += 1;
            }
        }

        if !has_wildcard {
            // Wildcards past the hashed levels still make this a wildcard filter
            has_wildcard = bytes[pos..].iter().any(|b| matches!(b, b'+' | b'#'));
        }

        Self {
            hash,
            mask: !wildcard_levels,
            has_wildcard,
        }
    }

    /// Whether a topic with hash `topic` may match the filter this hash was
    /// computed from.
    #[inline]
    pub fn may_match(&self, topic: &TopicHash) -> bool {
        if self.has_wildcard {
            topic.hash & self.mask == self.hash
        } else {
            topic.hash == self.hash
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::is_match;
    use proptest::prelude::*;

    #[test]
    fn test_literal_topic_has_full_mask() {
        let h = TopicHash::calculate("a/b/c");
        assert_eq!(h.mask, u64::MAX);
        assert!(!h.has_wildcard);
        assert_eq!(h, TopicHash::calculate("a/b/c"));
    }

    #[test]
    fn test_wildcard_levels_are_masked() {
        let plus = TopicHash::calculate("a/+/c");
        assert!(plus.has_wildcard);
        assert_eq!(plus.mask, 0xFF00_FFFF_FFFF_FFFF);

        let hash = TopicHash::calculate("a/#");
        assert_eq!(hash.mask, 0xFF00_0000_0000_0000);
    }

    #[test]
    fn test_hash_filter_matches_parent_topic() {
        let filter = TopicHash::calculate("sport/#");
        assert!(filter.may_match(&TopicHash::calculate("sport")));
        assert!(filter.may_match(&TopicHash::calculate("sport/tennis/player1")));
    }

    #[test]
    fn test_wildcard_beyond_hashed_levels() {
        let h = TopicHash::calculate("1/2/3/4/5/6/7/8/9/+");
        assert!(h.has_wildcard);
        assert!(h.may_match(&TopicHash::calculate("1/2/3/4/5/6/7/8/9/10")));
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("a".to_string()),
            Just("b".to_string()),
            Just("sport".to_string()),
            Just("é".to_string()),
            "[a-z]{1,3}",
        ]
    }

    fn filter_level() -> impl Strategy<Value = String> {
        prop_oneof![3 => level(), 1 => Just("+".to_string())]
    }

    proptest! {
        #[test]
        fn prop_hash_never_hides_a_match(
            topic in prop::collection::vec(level(), 1..12),
            filter in prop::collection::vec(filter_level(), 1..12),
            tail_hash in any::<bool>(),
        ) {
            let topic = topic.join("/");
            let mut filter = filter.join("/");
            if tail_hash {
                filter.push_str("/#");
            }
            if is_match(&topic, &filter) {
                let filter_hash = TopicHash::calculate(&filter);
                prop_assert!(filter_hash.may_match(&TopicHash::calculate(&topic)));
            }
        }
    }
}
