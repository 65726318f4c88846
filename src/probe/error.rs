//! Probe error text simplification.

/// Error prefixes whose messages get reduced to their final cause.
///
/// Transport errors carry the peer address and port in their text, which
/// would make identical failures against different hosts look distinct.
/// Stripping everything up to the last ": " separator keeps the text stable
/// for grouping.
const STRIP_ERRORS: [&str; 5] = [
    "Conversation error",
    "Could not connect",
    "dial tcp",
    "read tcp",
    "write tcp",
];

/// Reduces a well-known transport error to its final cause.
///
/// `"dial tcp 203.0.113.5:25: connection refused"` becomes
/// `"connection refused"`. Messages without a recognised prefix, or without
/// a ": " separator, are returned unchanged.
pub(crate) fn simplify_probe_error(message: &str) -> String {
    for prefix in STRIP_ERRORS {
        if message.starts_with(prefix) {
            if let Some(index) = message.rfind(": ") {
                return message[index + 2..].to_string();
            }
        }
    }
    message.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_error_is_reduced_to_cause() {
        assert_eq!(
            simplify_probe_error("dial tcp 203.0.113.5:25: connection refused"),
            "connection refused"
        );
    }

    #[test]
    fn test_last_separator_wins() {
        assert_eq!(
            simplify_probe_error("read tcp 203.0.113.5:25: read: connection reset by peer"),
            "connection reset by peer"
        );
    }

    #[test]
    fn test_unlisted_prefix_is_untouched() {
        assert_eq!(
            simplify_probe_error("certificate signed by unknown authority: extra"),
            "certificate signed by unknown authority: extra"
        );
    }

    #[test]
    fn test_listed_prefix_without_separator_is_untouched() {
        assert_eq!(simplify_probe_error("Could not connect"), "Could not connect");
    }
}
