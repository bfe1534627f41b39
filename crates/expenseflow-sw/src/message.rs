//! Commands posted by the foreground app.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

/// A message from a page, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
    /// Add the given URLs to the dynamic cache.
    CacheUrls { urls: Vec<String> },
    /// Delete every cache store.
    ClearCache,
}

impl ClientMessage {
    /// Decode a message; anything without a known `type` is ignored.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        match serde_json::from_value(data.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(error = %e, data = %data, "Ignoring unrecognized message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_messages() {
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "SKIP_WAITING" })),
            Some(ClientMessage::SkipWaiting)
        );
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "CACHE_URLS", "urls": ["/a", "/b"] })),
            Some(ClientMessage::CacheUrls {
                urls: vec!["/a".to_string(), "/b".to_string()]
            })
        );
        assert_eq!(
            ClientMessage::parse(&json!({ "type": "CLEAR_CACHE", "reason": "user" })),
            Some(ClientMessage::ClearCache)
        );
    }

    #[test]
    fn test_unknown_or_malformed_messages_are_ignored() {
        assert_eq!(ClientMessage::parse(&json!({ "type": "PING" })), None);
        assert_eq!(ClientMessage::parse(&json!({ "type": "CACHE_URLS" })), None);
        assert_eq!(ClientMessage::parse(&json!("SKIP_WAITING")), None);
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_value(ClientMessage::ClearCache).unwrap();
        assert_eq!(json, json!({ "type": "CLEAR_CACHE" }));
    }
}
