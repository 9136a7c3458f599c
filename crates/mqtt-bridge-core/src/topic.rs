//! MQTT topic names and filters.

/// Validate a topic name used for publishing.
///
/// # Errors
///
/// Returns error if the topic is empty, contains wildcards or NUL.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopic(topic.to_string()));
    }
    if topic.contains('\0') {
        return Err(TopicError::Invalid(topic.to_string()));
    }
    Ok(())
}

/// Validate a topic filter used for subscribing.
///
/// `+` must occupy a whole level and `#` must be the last level.
///
/// # Errors
///
/// Returns error if the filter is malformed.
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::Invalid(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (idx, level) in levels.iter().enumerate() {
        let is_last = idx == levels.len() - 1;
        match *level {
            "#" if !is_last => return Err(TopicError::Invalid(filter.to_string())),
            "#" | "+" => {}
            level if level.contains(['+', '#']) => {
                return Err(TopicError::Invalid(filter.to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether `topic` matches `filter`.
///
/// Topics starting with `$` never match a filter starting with a wildcard.
#[must_use]
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
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

/// Whether a filter contains wildcards.
#[must_use]
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Topic errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Topic is empty
    #[error("topic is empty")]
    Empty,
    /// Wildcards are not allowed in topic names
    #[error("wildcards not allowed in topic name: {0}")]
    WildcardInTopic(String),
    /// Malformed topic or filter
    #[error("invalid topic or filter: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names() {
        assert!(validate_topic("robot1/state").is_ok());
        assert_eq!(validate_topic(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_topic("robot1/+"),
            Err(TopicError::WildcardInTopic(_))
        ));
    }

    #[test]
    fn filters() {
        assert!(validate_filter("robot1/#").is_ok());
        assert!(validate_filter("+/state").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("robot1/#/state").is_err());
        assert!(validate_filter("robot1/st+te").is_err());
    }

    #[test]
    fn filter_matching() {
        assert!(matches("robot1/state", "robot1/state"));
        assert!(matches("robot1/state", "robot1/+"));
        assert!(matches("robot1/sensors/imu", "robot1/#"));
        assert!(matches("robot1", "robot1/#"));
        assert!(!matches("robot2/state", "robot1/+"));
        assert!(!matches("robot1/sensors/imu", "robot1/+"));
        assert!(!matches("robot1", "robot1/+"));
        assert!(!matches("$SYS/uptime", "#"));
        assert!(matches("$SYS/uptime", "$SYS/#"));
    }
}
