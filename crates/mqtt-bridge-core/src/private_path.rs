//! Private topic namespacing.
//!
//! A topic starting with `~` (optionally `~/`) is relative to the bridge's
//! private path. With prefix `robot1`, `~/state` and `~state` both resolve to
//! `robot1/state`. Unmarked topics are already fully qualified and pass
//! through untouched.

/// Marker identifying a private (relative) topic.
pub const PRIVATE_MARKER: char = '~';

/// Resolves private topics under a fixed prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivatePathExtractor {
    prefix: String,
}

impl PrivatePathExtractor {
    /// Create an extractor for the given prefix.
    ///
    /// Trailing slashes on the prefix are dropped so joins never produce `//`.
    /// A leading private marker is dropped too: a resolved topic must never
    /// be private again.
    #[must_use]
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: prefix
                .as_ref()
                .trim_start_matches(PRIVATE_MARKER)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    /// The normalized prefix. Empty when private paths are disabled.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `topic` carries the private marker.
    #[must_use]
    pub fn is_private(topic: &str) -> bool {
        topic.starts_with(PRIVATE_MARKER)
    }

    /// Resolve `topic` to its fully qualified form.
    #[must_use]
    pub fn resolve(&self, topic: &str) -> String {
        if self.prefix.is_empty() {
            return topic.to_string();
        }

        match strip_marker(topic) {
            Some(rest) if rest.is_empty() => self.prefix.clone(),
            Some(rest) => format!("{}/{rest}", self.prefix),
            None => topic.to_string(),
        }
    }
}

/// Strip the private marker and any slashes that follow it.
///
/// Returns `None` when the topic is not private.
#[must_use]
pub fn strip_marker(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(PRIVATE_MARKER)
        .map(|rest| rest.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_prefix_is_identity() {
        let extractor = PrivatePathExtractor::new("");
        assert_eq!(extractor.resolve("~/state"), "~/state");
        assert_eq!(extractor.resolve("state"), "state");
    }

    #[test]
    fn private_topic_gets_prefix() {
        let extractor = PrivatePathExtractor::new("robot1");
        assert_eq!(extractor.resolve("~/state"), "robot1/state");
        assert_eq!(extractor.resolve("~state"), "robot1/state");
        assert_eq!(extractor.resolve("~/sensors/imu"), "robot1/sensors/imu");
    }

    #[test]
    fn public_topic_unchanged() {
        let extractor = PrivatePathExtractor::new("robot1");
        assert_eq!(extractor.resolve("fleet/ping"), "fleet/ping");
    }

    #[test]
    fn separators_are_collapsed_at_the_join() {
        let extractor = PrivatePathExtractor::new("robot1//");
        assert_eq!(extractor.prefix(), "robot1");
        assert_eq!(extractor.resolve("~//state"), "robot1/state");
        assert_eq!(extractor.resolve("~"), "robot1");
    }

    #[test]
    fn marked_prefix_is_not_applied_twice() {
        let extractor = PrivatePathExtractor::new("~robot1");
        assert_eq!(extractor.prefix(), "robot1");

        let once = extractor.resolve("~state");
        assert_eq!(once, "robot1/state");
        assert_eq!(extractor.resolve(&once), once);
    }

    proptest! {
        #[test]
        fn private_join_has_single_separator(
            prefix in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,2}/{0,2}",
            rest in "/{0,2}[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,2}",
        ) {
            let extractor = PrivatePathExtractor::new(&prefix);
            let topic = format!("~{rest}");
            let resolved = extractor.resolve(&topic);

            let expected = format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                rest.trim_start_matches('/')
            );
            prop_assert_eq!(&resolved, &expected);
            prop_assert!(!resolved.contains("//"));
        }

        #[test]
        fn resolve_is_idempotent(
            prefix in "[~a-z0-9/]{0,12}",
            topic in "~?/?[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}",
        ) {
            let extractor = PrivatePathExtractor::new(&prefix);
            let once = extractor.resolve(&topic);
            prop_assert_eq!(extractor.resolve(&once), once);
        }

        #[test]
        fn unmarked_topics_pass_through(
            prefix in "[a-z0-9]{0,8}",
            topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}",
        ) {
            let extractor = PrivatePathExtractor::new(&prefix);
            prop_assert_eq!(extractor.resolve(&topic), topic);
        }
    }
}
