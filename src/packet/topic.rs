/// Topic names and filters must not encode to more than 65535 bytes
pub const MAX_TOPIC_LEN: usize = 65535;

/// Whether a string contains subscription wildcards
pub fn has_wildcards(s: impl AsRef<str>) -> bool {
    s.as_ref().contains(['+', '#'])
}

/// Whether a topic can be published to. Publish topics take no wildcards
pub fn valid_topic(topic: impl AsRef<str>) -> bool {
    well_formed(&topic) && !has_wildcards(topic)
}

/// Whether a subscription filter is well formed. `#` may only be the
/// whole last level and `+` must cover a whole level wherever it appears
pub fn valid_filter(filter: impl AsRef<str>) -> bool {
    let filter = filter.as_ref();
    if !well_formed(filter) {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (position, level) in levels.iter().enumerate() {
        match *level {
            "#" if position + 1 != levels.len() => return false,
            "#" | "+" => (),
            level if level.contains(['#', '+']) => return false,
            _ => (),
        }
    }

    true
}

/// Shared rules for topic names and filters: at least one byte, at most
/// [`MAX_TOPIC_LEN`], no null character
fn well_formed(topic_or_filter: impl AsRef<str>) -> bool {
    let value = topic_or_filter.as_ref();
    !value.is_empty() && value.len() <= MAX_TOPIC_LEN && !value.contains('\0')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn publish_topics_take_no_wildcards() {
        assert!(valid_topic("sensors/kitchen/temp"));
        assert!(valid_topic("/"));
        assert!(!valid_topic(""));
        assert!(!valid_topic("sensors/+/temp"));
        assert!(!valid_topic("sensors/#"));
        assert!(!valid_topic("sens#rs"));
    }

    #[test]
    fn multi_level_wildcard_must_end_the_filter() {
        assert!(valid_filter("#"));
        assert!(valid_filter("sensors/#"));
        assert!(!valid_filter("#/sensors"));
        assert!(!valid_filter("sensors/#/temp"));
        assert!(!valid_filter("sensors#"));
    }

    #[test]
    fn single_level_wildcard_must_cover_a_whole_level() {
        assert!(valid_filter("+"));
        assert!(valid_filter("sensors/+/temp"));
        assert!(valid_filter("+/+/+"));
        assert!(!valid_filter("sensors/temp+"));
        assert!(!valid_filter("sensors/+temp/x"));
        assert!(!valid_filter("sensors/++/temp"));
    }

    #[test]
    fn empty_filters_are_invalid() {
        assert!(!valid_filter(""));
    }
}
