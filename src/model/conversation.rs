//! Per-participant conversation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved collected-data key: field name the bot is waiting to fill.
pub const LAST_QUESTION_KEY: &str = "_last_question";

/// Reserved collected-data key: node id of the paused `collect_data` node.
pub const WAITING_NODE_KEY: &str = "_waiting_node_id";

/// A connected messaging account the engine sends on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Platform-side user id of the account (the DM sender).
    pub platform_id: String,
    pub username: Option<String>,
}

/// Conversation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Normal bot-driven conversation.
    Active,
    /// Paused mid-flow, waiting for the participant's reply.
    Waiting,
    /// Participant asked for (or was escalated to) a human operator.
    HumanRequested,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Waiting => "waiting",
            ConversationStatus::HumanRequested => "human_requested",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "waiting" => ConversationStatus::Waiting,
            "human_requested" => ConversationStatus::HumanRequested,
            "closed" => ConversationStatus::Closed,
            _ => ConversationStatus::Active,
        }
    }
}

/// The persisted per-participant conversation record.
///
/// Invariant: at most one active automation. When `status` is `Waiting`,
/// `collected_data` carries `_waiting_node_id`, resolvable in the active
/// automation's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Platform participant id (PSID).
    pub participant_id: String,
    pub participant_username: Option<String>,
    pub participant_name: Option<String>,
    pub profile_picture_url: Option<String>,
    pub status: ConversationStatus,
    /// The automation currently driving this conversation, if any.
    pub active_automation: Option<Uuid>,
    /// Step index within a flat action-list automation.
    pub step_index: u32,
    /// Ordered map of collected field → value. Keys starting with `_` are
    /// engine-internal markers.
    pub collected_data: serde_json::Map<String, serde_json::Value>,
    pub tags: Vec<String>,
    pub needs_human: bool,
    pub is_bot_active: bool,
    pub profile_synced_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// New conversation for a (account, participant) pair.
    pub fn new(account_id: Uuid, participant_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            participant_id: participant_id.into(),
            participant_username: None,
            participant_name: None,
            profile_picture_url: None,
            status: ConversationStatus::Active,
            active_automation: None,
            step_index: 0,
            collected_data: serde_json::Map::new(),
            tags: Vec::new(),
            needs_human: false,
            is_bot_active: true,
            profile_synced_at: None,
            last_message_at: None,
            created_at: Utc::now(),
        }
    }

    /// Best available display name for templates.
    pub fn display_name(&self) -> &str {
        self.participant_name
            .as_deref()
            .or(self.participant_username.as_deref())
            .unwrap_or("")
    }

    pub fn is_waiting(&self) -> bool {
        self.status == ConversationStatus::Waiting
    }

    /// Node id of the paused `collect_data` node, if the flow is waiting.
    pub fn waiting_node_id(&self) -> Option<&str> {
        self.collected_data.get(WAITING_NODE_KEY)?.as_str()
    }

    /// Field name the bot last asked for, if a question is pending.
    pub fn pending_question(&self) -> Option<&str> {
        self.collected_data.get(LAST_QUESTION_KEY)?.as_str()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the participant profile needs a refresh from the platform.
    pub fn profile_is_stale(&self, freshness: std::time::Duration) -> bool {
        if self.participant_name.is_none() {
            return true;
        }
        match self.profile_synced_at {
            None => true,
            Some(synced) => {
                let age = Utc::now().signed_duration_since(synced);
                age.num_seconds() >= freshness.as_secs() as i64
            }
        }
    }
}
