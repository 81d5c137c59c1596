//! Topic filter matching

/// Check whether `filter` matches the concrete `topic`.
///
/// - `+` consumes exactly one level, empty levels included
/// - `#` consumes the remaining levels, including none at all
/// - levels compare byte for byte
/// - topics starting with `$` are never matched by a leading `+` or `#`
pub fn is_match(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        match filter_level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => match topic_levels.next() {
                Some(level) if level == literal => {}
                _ => return false,
            },
        }
    }

    topic_levels.next().is_none()
}
