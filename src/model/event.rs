//! Inbound webhook events.

use serde::{Deserialize, Serialize};

use crate::model::message::MessageKind;

/// A single inbound event from the platform webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Platform participant id (PSID) of the sender.
    pub sender_id: String,
    /// Message text; empty for pure attachment events.
    #[serde(default)]
    pub message_text: String,
    /// Event type as reported by the platform ("message", "comment", ...).
    #[serde(rename = "type", default = "default_event_type")]
    pub event_type: String,
    /// Quick-reply or button payload, when the user tapped a button.
    #[serde(default)]
    pub payload: Option<String>,
    /// Attachment URLs, when present.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Platform message id, when provided.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
}

fn default_event_type() -> String {
    "message".to_string()
}

impl InboundEvent {
    pub fn message(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            message_text: text.into(),
            event_type: "message".to_string(),
            payload: None,
            attachments: Vec::new(),
            message_id: None,
            sender_username: None,
            sender_name: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Classify how the incoming message should be recorded.
    pub fn message_kind(&self) -> MessageKind {
        if !self.attachments.is_empty() {
            MessageKind::Media
        } else if self.payload.is_some() {
            MessageKind::QuickReply
        } else {
            MessageKind::Text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_webhook_payload() {
        let event: InboundEvent =
            serde_json::from_str(r#"{"sender_id": "123", "message_text": "salom"}"#).unwrap();
        assert_eq!(event.sender_id, "123");
        assert_eq!(event.event_type, "message");
        assert!(event.payload.is_none());
    }

    #[test]
    fn message_kind_classification() {
        let text = InboundEvent::message("1", "hi");
        assert_eq!(text.message_kind(), MessageKind::Text);

        let tapped = InboundEvent::message("1", "Yes").with_payload("FLOW:node-2");
        assert_eq!(tapped.message_kind(), MessageKind::QuickReply);

        let mut media = InboundEvent::message("1", "");
        media.attachments.push("https://cdn.example/img.jpg".into());
        assert_eq!(media.message_kind(), MessageKind::Media);
    }
}
