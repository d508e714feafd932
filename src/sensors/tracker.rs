use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

fn content_hash(payload: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

/// Remembers which discovery payloads have been sent, keyed by unique id.
/// A payload is resent only when its content changes.
#[derive(Debug, Default)]
pub struct PublicationTracker {
    published: HashMap<String, u64>,
}

impl PublicationTracker {
    pub fn new() -> Self {
        return PublicationTracker::default();
    }

    pub fn should_publish_config(&self, unique_id: &str, payload: &str) -> bool {
        self.published.get(unique_id) != Some(&content_hash(payload))
    }

    pub fn record_published(&mut self, unique_id: &str, payload: &str) {
        self.published.insert(unique_id.to_string(), content_hash(payload));
    }

    pub fn reset(&mut self) {
        self.published.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_once_per_content() {
        let mut tracker = PublicationTracker::new();
        assert!(tracker.should_publish_config("CE301_00123456_CURRE_0", r#"{"name":"Current 0"}"#));
        tracker.record_published("CE301_00123456_CURRE_0", r#"{"name":"Current 0"}"#);

        for _ in 0..3 {
            assert!(!tracker.should_publish_config("CE301_00123456_CURRE_0", r#"{"name":"Current 0"}"#));
        }
        /* Other entities are tracked separately */
        assert!(tracker.should_publish_config("CE301_00123456_CURRE_1", r#"{"name":"Current 0"}"#));
    }

    #[test]
    fn test_changed_content_republished() {
        let mut tracker = PublicationTracker::new();
        tracker.record_published("id", r#"{"name":"Energy 04.22"}"#);

        assert!(tracker.should_publish_config("id", r#"{"name":"Energy 05.22"}"#));
        tracker.record_published("id", r#"{"name":"Energy 05.22"}"#);
        assert!(!tracker.should_publish_config("id", r#"{"name":"Energy 05.22"}"#));
    }

    #[test]
    fn test_reset() {
        let mut tracker = PublicationTracker::new();
        tracker.record_published("id", "{}");
        tracker.reset();
        assert!(tracker.should_publish_config("id", "{}"));
    }
}
