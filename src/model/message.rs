//! Message rows. Append-only, one per send or receive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Buttons,
    Media,
    QuickReply,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Buttons => "buttons",
            MessageKind::Media => "media",
            MessageKind::QuickReply => "quick_reply",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "buttons" => MessageKind::Buttons,
            "media" => MessageKind::Media,
            "quick_reply" => MessageKind::QuickReply,
            _ => MessageKind::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Platform-assigned message id, when the platform returned one.
    pub platform_message_id: Option<String>,
    pub direction: Direction,
    pub kind: MessageKind,
    pub content: String,
    /// Sent by an automation rather than a human operator.
    pub automated: bool,
    pub delivery_status: DeliveryStatus,
    /// Reason code for failed sends (e.g. `24h_window`).
    pub failure_reason: Option<String>,
    /// Automation that produced this message, if any.
    pub automation_id: Option<Uuid>,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn incoming(conversation_id: Uuid, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            platform_message_id: None,
            direction: Direction::Incoming,
            kind,
            content: content.into(),
            automated: false,
            delivery_status: DeliveryStatus::Sent,
            failure_reason: None,
            automation_id: None,
            sent_at: Utc::now(),
        }
    }

    pub fn outgoing(
        conversation_id: Uuid,
        kind: MessageKind,
        content: impl Into<String>,
        automation_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            platform_message_id: None,
            direction: Direction::Outgoing,
            kind,
            content: content.into(),
            automated: automation_id.is_some(),
            delivery_status: DeliveryStatus::Sent,
            failure_reason: None,
            automation_id,
            sent_at: Utc::now(),
        }
    }

    /// Mark this message as a failed send with a reason code.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.delivery_status = DeliveryStatus::Failed;
        self.failure_reason = Some(reason.into());
        self
    }
}
