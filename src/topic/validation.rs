//! Topic name and filter validation
//!
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - `#` must be the last level and occupy it entirely
//! - `+` must occupy an entire level
//! - Topics starting with `$` are not matched by filters starting with a wildcard

/// Validate a topic name (used in PUBLISH and will messages)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    validate_topic_name_with_max_levels(topic, 0)
}

/// Validate a topic name with configurable max levels (0 = unlimited)
pub fn validate_topic_name_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    check_common(topic)?;

    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }

    if max_topic_levels > 0 && topic.split('/').count() > max_topic_levels {
        return Err("topic exceeds maximum allowed levels");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    validate_topic_filter_with_max_levels(filter, 0)
}

/// Validate a topic filter with configurable max levels (0 = unlimited)
pub fn validate_topic_filter_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    check_common(filter)?;

    let mut levels = filter.split('/').enumerate().peekable();
    while let Some((index, level)) = levels.next() {
        if max_topic_levels > 0 && index >= max_topic_levels {
            return Err("topic filter exceeds maximum allowed levels");
        }

        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

fn check_common(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("topic cannot be empty");
    }
    if s.len() > 65535 {
        return Err("topic exceeds maximum length");
    }
    if s.contains('\0') {
        return Err("topic cannot contain null character");
    }
    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Used where a trie is not available, e.g. scanning retained messages for a
/// freshly subscribed filter.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
