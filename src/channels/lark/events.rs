//! Inbound `im.message.receive_v1` decoding.

use crate::channels::traits::ChannelMessage;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub(super) const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";

/// Message ids are remembered this long to drop redelivered events.
const DEDUP_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Decode the `content` field of a message. Text messages carry
/// `{"text": "..."}`; content that is not valid JSON is passed through raw.
/// Other message types and blank text yield `None`.
pub(super) fn decode_text_content(message_type: &str, content: &str) -> Option<String> {
    if message_type != "text" {
        return None;
    }
    let text = match serde_json::from_str::<serde_json::Value>(content) {
        Ok(value) => value
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        Err(_) => content.to_string(),
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Turn an event envelope (`{"header": {...}, "event": {...}}`) into a message.
pub(super) fn parse_message_event(
    payload: &serde_json::Value,
    channel: &str,
) -> Option<ChannelMessage> {
    let event_type = payload
        .pointer("/header/event_type")
        .and_then(|e| e.as_str())
        .unwrap_or("");
    if event_type != MESSAGE_RECEIVE_EVENT {
        return None;
    }

    let event = payload.get("event")?;
    let message = event.get("message")?;
    let str_at = |value: &serde_json::Value, pointer: &str| {
        value
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    let message_type = str_at(message, "/message_type");
    let Some(content) = decode_text_content(&message_type, &str_at(message, "/content")) else {
        tracing::debug!("Lark: skipping {message_type} message");
        return None;
    };

    let sender = event
        .get("sender")
        .or_else(|| message.get("sender"))
        .cloned()
        .unwrap_or_default();
    let open_id = str_at(&sender, "/sender_id/open_id");
    let chat_id = str_at(message, "/chat_id");

    let timestamp = message
        .get("create_time")
        .and_then(|t| t.as_str())
        .and_then(|t| t.parse::<u64>().ok())
        // milliseconds on the wire
        .map_or_else(now_unix_secs, |ms| ms / 1000);

    Some(ChannelMessage {
        id: str_at(message, "/message_id"),
        chat_id: if chat_id.is_empty() {
            open_id.clone()
        } else {
            chat_id
        },
        sender_name: if open_id.is_empty() {
            "Unknown".to_string()
        } else {
            open_id.clone()
        },
        sender: open_id,
        content,
        channel: channel.to_string(),
        timestamp,
        is_from_me: str_at(&sender, "/sender_type") == "app",
    })
}

/// Message ids seen within the dedup window.
#[derive(Default)]
pub(super) struct SeenMessages {
    seen: HashMap<String, Instant>,
}

impl SeenMessages {
    /// True the first time `id` is seen within the window.
    pub fn first_sighting(&mut self, id: &str, now: Instant) -> bool {
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < DEDUP_WINDOW);
        if id.is_empty() {
            return true;
        }
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_event(content: &str) -> serde_json::Value {
        json!({
            "header": { "event_type": "im.message.receive_v1", "event_id": "ev_1" },
            "event": {
                "sender": {
                    "sender_id": { "open_id": "ou_user" },
                    "sender_type": "user"
                },
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_group",
                    "chat_type": "group",
                    "message_type": "text",
                    "content": content,
                    "create_time": "1700000000123"
                }
            }
        })
    }

    #[test]
    fn parses_text_message() {
        let msg = parse_message_event(&text_event(r#"{"text":"你好 world"}"#), "feishu").unwrap();
        assert_eq!(msg.id, "om_1");
        assert_eq!(msg.chat_id, "oc_group");
        assert_eq!(msg.sender, "ou_user");
        assert_eq!(msg.sender_name, "ou_user");
        assert_eq!(msg.content, "你好 world");
        assert_eq!(msg.channel, "feishu");
        assert_eq!(msg.timestamp, 1_700_000_000);
        assert!(!msg.is_from_me);
    }

    #[test]
    fn invalid_content_json_passes_through_raw() {
        let msg = parse_message_event(&text_event("plain words"), "lark").unwrap();
        assert_eq!(msg.content, "plain words");
    }

    #[test]
    fn blank_text_is_skipped() {
        assert!(parse_message_event(&text_event(r#"{"text":"   "}"#), "lark").is_none());
        assert!(parse_message_event(&text_event(r#"{"image_key":"x"}"#), "lark").is_none());
    }

    #[test]
    fn non_text_types_are_skipped() {
        let mut event = text_event(r#"{"image_key":"img_1"}"#);
        event["event"]["message"]["message_type"] = json!("image");
        assert!(parse_message_event(&event, "lark").is_none());
    }

    #[test]
    fn other_event_types_are_ignored() {
        let mut event = text_event(r#"{"text":"hi"}"#);
        event["header"]["event_type"] = json!("im.chat.updated_v1");
        assert!(parse_message_event(&event, "lark").is_none());
        assert!(parse_message_event(&json!({}), "lark").is_none());
    }

    #[test]
    fn app_sender_is_flagged_as_from_me() {
        let mut event = text_event(r#"{"text":"echo"}"#);
        event["event"]["sender"]["sender_type"] = json!("app");
        assert!(parse_message_event(&event, "lark").unwrap().is_from_me);
    }

    #[test]
    fn missing_sender_defaults_to_unknown() {
        let mut event = text_event(r#"{"text":"hi"}"#);
        event["event"]
            .as_object_mut()
            .unwrap()
            .remove("sender");
        let msg = parse_message_event(&event, "lark").unwrap();
        assert_eq!(msg.sender, "");
        assert_eq!(msg.sender_name, "Unknown");
    }

    #[test]
    fn dedup_drops_repeats_within_window() {
        let mut seen = SeenMessages::default();
        let start = Instant::now();
        assert!(seen.first_sighting("om_1", start));
        assert!(!seen.first_sighting("om_1", start + Duration::from_secs(60)));
        assert!(seen.first_sighting("om_2", start + Duration::from_secs(60)));
        assert!(seen.first_sighting("om_1", start + DEDUP_WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn empty_ids_are_never_deduplicated() {
        let mut seen = SeenMessages::default();
        assert!(seen.first_sighting("", Instant::now()));
        assert!(seen.first_sighting("", Instant::now()));
    }
}
