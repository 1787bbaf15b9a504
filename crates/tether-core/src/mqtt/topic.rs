//! Topic filter matching.

/// Whether a received `topic` matches a subscription `pattern`.
///
/// Supports `+` (one level) and `#` (rest of the topic). Topics starting
/// with `$` are reserved: wildcards only apply to them once the match has
/// crossed the first `/`.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let topic = topic.as_bytes();
    let is_normal = topic.first().is_some_and(|&c| c != b'$');
    match_from(topic, pattern.as_bytes(), is_normal, false)
}

fn match_from(topic: &[u8], pattern: &[u8], is_normal: bool, past_separator: bool) -> bool {
    let (t, p) = match (topic.first(), pattern.first()) {
        (None, None) => return true,
        (None, _) | (_, None) => return false,
        (Some(&t), Some(&p)) => (t, p),
    };

    let wildcards = is_normal || past_separator;

    if p == b'+' && wildcards {
        let level_end = topic
            .iter()
            .position(|&c| c == b'/')
            .unwrap_or(topic.len());
        return match_from(&topic[level_end..], &pattern[1..], is_normal, true);
    }

    // `#` is only valid as the last token.
    if p == b'#' && wildcards {
        return true;
    }

    if t != p {
        return false;
    }

    match_from(
        &topic[1..],
        &pattern[1..],
        is_normal,
        past_separator || p == b'/',
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/b", "a/+"));
        assert!(!matches("a/b/c", "a/+"));
        assert!(matches("a/b/c", "a/+/c"));
        assert!(matches("sensor/temp", "+/temp"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("a/b/c", "a/#"));
        assert!(matches("a/b", "#"));
        assert!(!matches("b/c", "a/#"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("$SYS/x", "+/x"));
        assert!(!matches("$SYS/x", "#"));
        assert!(matches("$SYS/a/x", "$SYS/+/x"));
        assert!(matches("$SYS/a/x", "$SYS/#"));
    }

    #[test]
    fn test_literal_topics_match_themselves() {
        for t in ["a", "a/b", "home/kitchen/light", "$SYS/broker/uptime", "/leading", "trailing/"] {
            assert!(matches(t, t), "{t}");
        }
    }

    #[test]
    fn test_case_and_length_mismatch() {
        assert!(!matches("A/b", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("", "a"));
        assert!(matches("", ""));
    }
}
