pub const DEFAULT_CLIENT_ID: &str = "relay-switch";

pub const DEFAULT_COMMAND_TOPIC: &str = "relay/switch/cmnd";
pub const DEFAULT_STATE_TOPIC: &str = "relay/switch/state";
pub const DEFAULT_AVAILABILITY_TOPIC: &str = "relay/switch/status";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub const MAX_TOPIC_LEN: usize = 128;

/// A topic the device can publish or subscribe to literally: non-empty,
/// bounded, and free of MQTT wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && !topic.contains(['#', '+', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(is_valid_topic(DEFAULT_COMMAND_TOPIC));
        assert!(is_valid_topic(DEFAULT_STATE_TOPIC));
        assert!(is_valid_topic(DEFAULT_AVAILABILITY_TOPIC));
    }

    #[test]
    fn rejects_wildcards_and_empty() {
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("relay/#"));
        assert!(!is_valid_topic("relay/+/state"));
        assert!(!is_valid_topic(&"a".repeat(MAX_TOPIC_LEN + 1)));
    }
}
