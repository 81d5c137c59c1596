//! Topic name and filter validation
//!
//! - Topic names must not contain wildcards
//! - `+` must occupy a whole level
//! - `#` must occupy the last level
//! - Neither may be empty, longer than 65535 bytes or contain NUL

const MAX_TOPIC_LEN: usize = 65535;

/// Prefix of shared subscription filters
pub const SHARED_SUBSCRIPTION_PREFIX: &str = "$share/";

/// Validate a topic name (PUBLISH, will, retained, injected messages)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (SUBSCRIBE, UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err("multi-level wildcard must be the whole last level");
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }
    Ok(())
}

pub fn has_wildcard(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

pub fn is_shared_subscription(filter: &str) -> bool {
    filter.starts_with(SHARED_SUBSCRIPTION_PREFIX)
}

fn check_common(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("topic cannot be empty");
    }
    if s.len() > MAX_TOPIC_LEN {
        return Err("topic exceeds maximum length");
    }
    if s.contains('\0') {
        return Err("topic cannot contain null character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());
        assert!(validate_topic_name("$SYS/broker").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a\0b").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        for ok in ["test", "+", "#", "/", "test/+", "test/#", "+/+/+", "a/+/c/#"] {
            assert!(validate_topic_filter(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", "test+", "test#", "test/#/more", "+test", "a/b#", "##"] {
            assert!(validate_topic_filter(bad).is_err(), "{} should be invalid", bad);
        }
    }
}
