//! CRM collaborator seam.
//!
//! The engine reports conversational milestones (handoffs, collected data,
//! resolved intents) to a lead-management system it does not own. All
//! operations are idempotent on the CRM side, so the engine calls them
//! without existence checks.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::intent::Intent;
use crate::model::Conversation;

#[async_trait]
pub trait LeadService: Send + Sync {
    /// Ensure a lead exists for this conversation. Idempotent.
    async fn create_from_chatbot(&self, conversation: &Conversation) -> anyhow::Result<()>;

    /// Attach newly collected fields to the lead. Idempotent per field.
    async fn append_chatbot_data(
        &self,
        conversation_id: Uuid,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<()>;

    /// Record the latest resolved intent on the lead.
    async fn update_intent(&self, conversation_id: Uuid, intent: &Intent) -> anyhow::Result<()>;

    /// Notify the CRM that a human must take over the conversation.
    async fn notify_handoff(
        &self,
        conversation: &Conversation,
        reason: &str,
    ) -> anyhow::Result<()>;
}

/// No-CRM deployment: log and carry on.
pub struct NullLeadService;

#[async_trait]
impl LeadService for NullLeadService {
    async fn create_from_chatbot(&self, conversation: &Conversation) -> anyhow::Result<()> {
        debug!(conversation_id = %conversation.id, "lead creation skipped (no CRM configured)");
        Ok(())
    }

    async fn append_chatbot_data(
        &self,
        conversation_id: Uuid,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<()> {
        debug!(%conversation_id, fields = data.len(), "lead data skipped (no CRM configured)");
        Ok(())
    }

    async fn update_intent(&self, conversation_id: Uuid, intent: &Intent) -> anyhow::Result<()> {
        debug!(%conversation_id, kind = ?intent.kind, "intent update skipped (no CRM configured)");
        Ok(())
    }

    async fn notify_handoff(
        &self,
        conversation: &Conversation,
        reason: &str,
    ) -> anyhow::Result<()> {
        debug!(conversation_id = %conversation.id, reason, "handoff notification skipped (no CRM configured)");
        Ok(())
    }
}
