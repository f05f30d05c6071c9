//! Persistence trait for conversation state.
//!
//! The engine talks to storage through [`ConversationStore`] so tests and
//! alternative backends can swap in. Mutations are fine-grained (one method
//! per state transition) rather than whole-row saves; counter updates happen
//! in SQL so concurrent events never lose increments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Account, Automation, Conversation, ConversationStatus, Message};

/// Participant profile fields written after a platform sync.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub name: Option<String>,
    pub profile_picture_url: Option<String>,
    pub synced_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    // ── Accounts ────────────────────────────────────────────────────

    async fn create_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Look up the connected account receiving a webhook by its platform id.
    async fn account_by_platform_id(
        &self,
        platform_id: &str,
    ) -> Result<Option<Account>, StoreError>;

    // ── Automations ─────────────────────────────────────────────────

    async fn create_automation(&self, automation: &Automation) -> Result<(), StoreError>;

    async fn get_automation(&self, id: Uuid) -> Result<Option<Automation>, StoreError>;

    /// All active automations for an account, in creation order.
    async fn active_automations(&self, account_id: Uuid) -> Result<Vec<Automation>, StoreError>;

    /// Atomic counter bump; safe under concurrent events.
    async fn increment_trigger_count(&self, automation_id: Uuid) -> Result<(), StoreError>;

    async fn increment_conversion_count(&self, automation_id: Uuid) -> Result<(), StoreError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Fetch the conversation for an (account, participant) pair, creating
    /// it if this is the first contact.
    async fn get_or_create_conversation(
        &self,
        account_id: Uuid,
        participant_id: &str,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn set_status(&self, id: Uuid, status: ConversationStatus) -> Result<(), StoreError>;

    /// Attach an automation as the conversation's active run, resetting the
    /// step index.
    async fn start_automation(&self, id: Uuid, automation_id: Uuid) -> Result<(), StoreError>;

    /// Detach the active automation and return the conversation to `Active`.
    async fn end_automation(&self, id: Uuid) -> Result<(), StoreError>;

    async fn advance_step(&self, id: Uuid, step_index: u32) -> Result<(), StoreError>;

    /// Add a tag if absent. Idempotent.
    async fn add_tag(&self, id: Uuid, tag: &str) -> Result<(), StoreError>;

    /// Remove a tag if present. Idempotent.
    async fn remove_tag(&self, id: Uuid, tag: &str) -> Result<(), StoreError>;

    /// Replace the collected-data map (engine-internal `_` keys included).
    async fn update_collected_data(
        &self,
        id: Uuid,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Flip the handoff flags. `bot_active = false` silences the bot until
    /// an operator resumes it.
    async fn set_needs_human(
        &self,
        id: Uuid,
        needs_human: bool,
        bot_active: bool,
    ) -> Result<(), StoreError>;

    async fn update_profile(&self, id: Uuid, profile: &ProfileUpdate) -> Result<(), StoreError>;

    async fn touch_last_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn record_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Messages of a conversation, oldest first.
    async fn messages_for(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;

    // ── Run log ─────────────────────────────────────────────────────

    /// Record the start of an automation run, returning the run id.
    async fn record_run_started(
        &self,
        conversation_id: Uuid,
        automation_id: Uuid,
    ) -> Result<Uuid, StoreError>;

    /// Mark a run finished with an outcome label
    /// (`completed`, `waiting`, `handoff`, `scheduled`, `failed`).
    async fn record_run_finished(&self, run_id: Uuid, outcome: &str) -> Result<(), StoreError>;
}
