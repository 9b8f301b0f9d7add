//! Types for the message streaming feature.

use serde::{Deserialize, Serialize};

use crate::murmur::messages::{Channel, Message, Sequence};

/// A single "message appended" notification.
///
/// `channel` and `sequence` duplicate fields of `message` so receivers can
/// filter and dedupe without touching the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub channel: Channel,
    pub sequence: Sequence,
    pub message: Message,
}

impl From<&Message> for ChangeEvent {
    fn from(message: &Message) -> Self {
        Self {
            channel: message.channel.clone(),
            sequence: message.sequence,
            message: message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::murmur::messages::MessageType;

    #[test]
    fn event_mirrors_message_position() {
        let message = Message {
            id: Uuid::new_v4(),
            channel: Channel::global(),
            sequence: Sequence::new(9),
            sender_id: "user-1".to_string(),
            sender_name: "Ada".to_string(),
            sender_avatar_url: None,
            body: Some("hi".to_string()),
            message_type: MessageType::Text,
            attachment_ref: None,
            duration_ms: None,
            created_at: Utc::now(),
        };

        let event = ChangeEvent::from(&message);
        assert_eq!(event.channel, Channel::global());
        assert_eq!(event.sequence, Sequence::new(9));
        assert_eq!(event.message, message);

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["channel"], "global");
        assert_eq!(json["sequence"], 9);
        assert_eq!(json["message"]["message_type"], "text");
    }
}
