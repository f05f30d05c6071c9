//! libSQL backend for the async `ConversationStore` trait.
//!
//! Supports local file and in-memory databases. JSON-shaped columns
//! (triggers, actions, flow, collected_data, tags) round-trip through
//! serde_json.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    Account, Automation, AutomationStatus, Conversation, ConversationStatus, DeliveryStatus,
    Direction, Message, MessageKind,
};
use crate::store::migrations;
use crate::store::traits::{ConversationStore, ProfileUpdate};

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Pool(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_conversation(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const CONVERSATION_COLUMNS: &str = "id, account_id, participant_id, participant_username, \
     participant_name, profile_picture_url, status, active_automation, step_index, \
     collected_data, tags, needs_human, is_bot_active, profile_synced_at, last_message_at, \
     created_at";

const AUTOMATION_COLUMNS: &str =
    "id, account_id, name, status, triggers, actions, flow, trigger_count, conversion_count";

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn row_to_account(row: &libsql::Row) -> Result<Account, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let platform_id: String = row.get(1).map_err(query_err)?;
    let username: Option<String> = row.get(2).ok();
    Ok(Account {
        id: parse_uuid(&id),
        platform_id,
        username,
    })
}

fn row_to_automation(row: &libsql::Row) -> Result<Automation, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let name: String = row.get(2).map_err(query_err)?;
    let status: String = row.get(3).map_err(query_err)?;
    let triggers: String = row.get(4).map_err(query_err)?;
    let actions: String = row.get(5).map_err(query_err)?;
    let flow: Option<String> = row.get(6).ok();
    let trigger_count: i64 = row.get(7).map_err(query_err)?;
    let conversion_count: i64 = row.get(8).map_err(query_err)?;

    Ok(Automation {
        id: parse_uuid(&id),
        account_id: parse_uuid(&account_id),
        name,
        status: AutomationStatus::parse(&status),
        triggers: serde_json::from_str(&triggers)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        actions: serde_json::from_str(&actions)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        flow: match flow {
            Some(raw) => {
                Some(serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?)
            }
            None => None,
        },
        trigger_count: trigger_count.max(0) as u64,
        conversion_count: conversion_count.max(0) as u64,
    })
}

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let account_id: String = row.get(1).map_err(query_err)?;
    let participant_id: String = row.get(2).map_err(query_err)?;
    let participant_username: Option<String> = row.get(3).ok();
    let participant_name: Option<String> = row.get(4).ok();
    let profile_picture_url: Option<String> = row.get(5).ok();
    let status: String = row.get(6).map_err(query_err)?;
    let active_automation: Option<String> = row.get(7).ok();
    let step_index: i64 = row.get(8).map_err(query_err)?;
    let collected_data: String = row.get(9).map_err(query_err)?;
    let tags: String = row.get(10).map_err(query_err)?;
    let needs_human: i64 = row.get(11).map_err(query_err)?;
    let is_bot_active: i64 = row.get(12).map_err(query_err)?;
    let profile_synced_at: Option<String> = row.get(13).ok();
    let last_message_at: Option<String> = row.get(14).ok();
    let created_at: String = row.get(15).map_err(query_err)?;

    Ok(Conversation {
        id: parse_uuid(&id),
        account_id: parse_uuid(&account_id),
        participant_id,
        participant_username,
        participant_name,
        profile_picture_url,
        status: ConversationStatus::parse(&status),
        active_automation: active_automation.as_deref().map(parse_uuid),
        step_index: step_index.max(0) as u32,
        collected_data: serde_json::from_str(&collected_data).unwrap_or_default(),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        needs_human: needs_human != 0,
        is_bot_active: is_bot_active != 0,
        profile_synced_at: profile_synced_at.as_deref().map(parse_datetime),
        last_message_at: last_message_at.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let conversation_id: String = row.get(1).map_err(query_err)?;
    let platform_message_id: Option<String> = row.get(2).ok();
    let direction: String = row.get(3).map_err(query_err)?;
    let kind: String = row.get(4).map_err(query_err)?;
    let content: String = row.get(5).map_err(query_err)?;
    let automation_id: Option<String> = row.get(6).ok();
    let automated: i64 = row.get(7).map_err(query_err)?;
    let delivery_status: String = row.get(8).map_err(query_err)?;
    let failure_reason: Option<String> = row.get(9).ok();
    let sent_at: String = row.get(10).map_err(query_err)?;

    Ok(Message {
        id: parse_uuid(&id),
        conversation_id: parse_uuid(&conversation_id),
        platform_message_id,
        direction: if direction == "incoming" {
            Direction::Incoming
        } else {
            Direction::Outgoing
        },
        kind: MessageKind::parse(&kind),
        content,
        automated: automated != 0,
        delivery_status: if delivery_status == "failed" {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Sent
        },
        failure_reason,
        automation_id: automation_id.as_deref().map(parse_uuid),
        sent_at: parse_datetime(&sent_at),
    })
}

// ── ConversationStore implementation ────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlStore {
    async fn create_account(&self, account: &Account) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO accounts (id, platform_id, username) VALUES (?1, ?2, ?3)",
                params![
                    account.id.to_string(),
                    account.platform_id.clone(),
                    account.username.clone()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, platform_id, username FROM accounts WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn account_by_platform_id(
        &self,
        platform_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, platform_id, username FROM accounts WHERE platform_id = ?1",
                params![platform_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_automation(&self, automation: &Automation) -> Result<(), StoreError> {
        let triggers = serde_json::to_string(&automation.triggers)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let actions = serde_json::to_string(&automation.actions)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let flow = automation
            .flow
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO automations
                    (id, account_id, name, status, triggers, actions, flow,
                     trigger_count, conversion_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    automation.id.to_string(),
                    automation.account_id.to_string(),
                    automation.name.clone(),
                    automation.status.as_str(),
                    triggers,
                    actions,
                    flow,
                    automation.trigger_count as i64,
                    automation.conversion_count as i64
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_automation(&self, id: Uuid) -> Result<Option<Automation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AUTOMATION_COLUMNS} FROM automations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_automation(&row)?)),
            None => Ok(None),
        }
    }

    async fn active_automations(&self, account_id: Uuid) -> Result<Vec<Automation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations
                     WHERE account_id = ?1 AND status = 'active'
                     ORDER BY created_at, id"
                ),
                params![account_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut automations = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            automations.push(row_to_automation(&row)?);
        }
        Ok(automations)
    }

    async fn increment_trigger_count(&self, automation_id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE automations SET trigger_count = trigger_count + 1,
                     updated_at = datetime('now') WHERE id = ?1",
                params![automation_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn increment_conversion_count(&self, automation_id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE automations SET conversion_count = conversion_count + 1,
                     updated_at = datetime('now') WHERE id = ?1",
                params![automation_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        account_id: Uuid,
        participant_id: &str,
    ) -> Result<Conversation, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE account_id = ?1 AND participant_id = ?2"
                ),
                params![account_id.to_string(), participant_id],
            )
            .await
            .map_err(query_err)?;

        if let Some(row) = rows.next().await.map_err(query_err)? {
            return row_to_conversation(&row);
        }

        let conversation = Conversation::new(account_id, participant_id);
        self.conn()
            .execute(
                "INSERT INTO conversations
                    (id, account_id, participant_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.id.to_string(),
                    account_id.to_string(),
                    participant_id,
                    conversation.status.as_str(),
                    conversation.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.load_conversation(id).await
    }

    async fn set_status(&self, id: Uuid, status: ConversationStatus) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn start_automation(&self, id: Uuid, automation_id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations
                 SET active_automation = ?2, step_index = 0, status = 'active'
                 WHERE id = ?1",
                params![id.to_string(), automation_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn end_automation(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations
                 SET active_automation = NULL, step_index = 0, status = 'active'
                 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn advance_step(&self, id: Uuid, step_index: u32) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET step_index = ?2 WHERE id = ?1",
                params![id.to_string(), step_index as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn add_tag(&self, id: Uuid, tag: &str) -> Result<(), StoreError> {
        let Some(mut conversation) = self.load_conversation(id).await? else {
            return Err(StoreError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        };
        if conversation.has_tag(tag) {
            return Ok(());
        }
        conversation.tags.push(tag.to_string());
        let tags = serde_json::to_string(&conversation.tags)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE conversations SET tags = ?2 WHERE id = ?1",
                params![id.to_string(), tags],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn remove_tag(&self, id: Uuid, tag: &str) -> Result<(), StoreError> {
        let Some(mut conversation) = self.load_conversation(id).await? else {
            return Err(StoreError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        };
        let before = conversation.tags.len();
        conversation.tags.retain(|t| t != tag);
        if conversation.tags.len() == before {
            return Ok(());
        }
        let tags = serde_json::to_string(&conversation.tags)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE conversations SET tags = ?2 WHERE id = ?1",
                params![id.to_string(), tags],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_collected_data(
        &self,
        id: Uuid,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE conversations SET collected_data = ?2 WHERE id = ?1",
                params![id.to_string(), raw],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_needs_human(
        &self,
        id: Uuid,
        needs_human: bool,
        bot_active: bool,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET needs_human = ?2, is_bot_active = ?3 WHERE id = ?1",
                params![id.to_string(), needs_human as i64, bot_active as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_profile(&self, id: Uuid, profile: &ProfileUpdate) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations
                 SET participant_username = COALESCE(?2, participant_username),
                     participant_name = COALESCE(?3, participant_name),
                     profile_picture_url = COALESCE(?4, profile_picture_url),
                     profile_synced_at = ?5
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    profile.username.clone(),
                    profile.name.clone(),
                    profile.profile_picture_url.clone(),
                    profile.synced_at.to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn touch_last_message(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
                params![id.to_string(), at.to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn record_message(&self, message: &Message) -> Result<(), StoreError> {
        let direction = match message.direction {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        };
        let delivery_status = match message.delivery_status {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        };
        self.conn()
            .execute(
                "INSERT INTO messages
                    (id, conversation_id, platform_message_id, direction, kind, content,
                     automation_id, automated, delivery_status, failure_reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.platform_message_id.clone(),
                    direction,
                    message.kind.as_str(),
                    message.content.clone(),
                    message.automation_id.map(|id| id.to_string()),
                    message.automated as i64,
                    delivery_status,
                    message.failure_reason.clone(),
                    message.sent_at.to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn messages_for(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, conversation_id, platform_message_id, direction, kind, content,
                        automation_id, automated, delivery_status, failure_reason, created_at
                 FROM messages WHERE conversation_id = ?1 ORDER BY created_at, id",
                params![conversation_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn record_run_started(
        &self,
        conversation_id: Uuid,
        automation_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let run_id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO automation_runs (id, conversation_id, automation_id, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id.to_string(),
                    conversation_id.to_string(),
                    automation_id.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(run_id)
    }

    async fn record_run_finished(&self, run_id: Uuid, outcome: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE automation_runs SET finished_at = ?2, outcome = ?3 WHERE id = ?1",
                params![run_id.to_string(), Utc::now().to_rfc3339(), outcome],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TriggerDef, TriggerType};

    async fn store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn account() -> Account {
        Account {
            id: Uuid::new_v4(),
            platform_id: format!("page_{}", Uuid::new_v4()),
            username: Some("shop_uz".into()),
        }
    }

    fn automation(account_id: Uuid) -> Automation {
        Automation {
            id: Uuid::new_v4(),
            account_id,
            name: "welcome".into(),
            status: AutomationStatus::Active,
            triggers: vec![TriggerDef {
                trigger_type: TriggerType::KeywordDm,
                keywords: vec!["salom".into()],
                case_sensitive: false,
                exact_match: false,
            }],
            actions: vec![],
            flow: None,
            trigger_count: 0,
            conversion_count: 0,
        }
    }

    #[tokio::test]
    async fn account_round_trip() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();

        let loaded = store.get_account(acct.id).await.unwrap().unwrap();
        assert_eq!(loaded.platform_id, acct.platform_id);

        let by_platform = store
            .account_by_platform_id(&acct.platform_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_platform.id, acct.id);

        assert!(store.get_account(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn automation_round_trip_with_triggers() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let auto = automation(acct.id);
        store.create_automation(&auto).await.unwrap();

        let loaded = store.get_automation(auto.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "welcome");
        assert_eq!(loaded.triggers.len(), 1);
        assert_eq!(loaded.triggers[0].keywords, vec!["salom"]);
    }

    #[tokio::test]
    async fn active_automations_excludes_drafts() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();

        let active = automation(acct.id);
        let mut draft = automation(acct.id);
        draft.status = AutomationStatus::Draft;
        store.create_automation(&active).await.unwrap();
        store.create_automation(&draft).await.unwrap();

        let listed = store.active_automations(acct.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }

    #[tokio::test]
    async fn counters_increment_atomically_in_sql() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let auto = automation(acct.id);
        store.create_automation(&auto).await.unwrap();

        store.increment_trigger_count(auto.id).await.unwrap();
        store.increment_trigger_count(auto.id).await.unwrap();
        store.increment_conversion_count(auto.id).await.unwrap();

        let loaded = store.get_automation(auto.id).await.unwrap().unwrap();
        assert_eq!(loaded.trigger_count, 2);
        assert_eq!(loaded.conversion_count, 1);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_participant() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();

        let first = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();
        let second = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let other = store
            .get_or_create_conversation(acct.id, "psid-2")
            .await
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn conversation_state_transitions_persist() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let auto = automation(acct.id);
        store.create_automation(&auto).await.unwrap();

        let convo = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();

        store.start_automation(convo.id, auto.id).await.unwrap();
        store.advance_step(convo.id, 3).await.unwrap();
        store
            .set_status(convo.id, ConversationStatus::Waiting)
            .await
            .unwrap();

        let loaded = store.get_conversation(convo.id).await.unwrap().unwrap();
        assert_eq!(loaded.active_automation, Some(auto.id));
        assert_eq!(loaded.step_index, 3);
        assert_eq!(loaded.status, ConversationStatus::Waiting);

        store.end_automation(convo.id).await.unwrap();
        let loaded = store.get_conversation(convo.id).await.unwrap().unwrap();
        assert!(loaded.active_automation.is_none());
        assert_eq!(loaded.status, ConversationStatus::Active);
        assert_eq!(loaded.step_index, 0);
    }

    #[tokio::test]
    async fn tags_are_idempotent() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let convo = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();

        store.add_tag(convo.id, "vip").await.unwrap();
        store.add_tag(convo.id, "vip").await.unwrap();
        store.add_tag(convo.id, "lead").await.unwrap();

        let loaded = store.get_conversation(convo.id).await.unwrap().unwrap();
        assert_eq!(loaded.tags, vec!["vip", "lead"]);

        store.remove_tag(convo.id, "vip").await.unwrap();
        store.remove_tag(convo.id, "vip").await.unwrap();
        let loaded = store.get_conversation(convo.id).await.unwrap().unwrap();
        assert_eq!(loaded.tags, vec!["lead"]);
    }

    #[tokio::test]
    async fn collected_data_round_trips() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let convo = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();

        let mut data = serde_json::Map::new();
        data.insert("phone".into(), serde_json::json!("+998901234567"));
        data.insert("_waiting_node_id".into(), serde_json::json!("n4"));
        store.update_collected_data(convo.id, &data).await.unwrap();

        let loaded = store.get_conversation(convo.id).await.unwrap().unwrap();
        assert_eq!(loaded.collected_data, data);
        assert_eq!(loaded.waiting_node_id(), Some("n4"));
    }

    #[tokio::test]
    async fn handoff_flags_persist() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let convo = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();

        store.set_needs_human(convo.id, true, false).await.unwrap();
        let loaded = store.get_conversation(convo.id).await.unwrap().unwrap();
        assert!(loaded.needs_human);
        assert!(!loaded.is_bot_active);
    }

    #[tokio::test]
    async fn profile_update_keeps_existing_fields() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let convo = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();

        store
            .update_profile(
                convo.id,
                &ProfileUpdate {
                    username: Some("ali_dev".into()),
                    name: Some("Ali".into()),
                    profile_picture_url: None,
                    synced_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        // A later partial sync must not blank out the name.
        store
            .update_profile(
                convo.id,
                &ProfileUpdate {
                    username: None,
                    name: None,
                    profile_picture_url: Some("https://cdn/p.jpg".into()),
                    synced_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let loaded = store.get_conversation(convo.id).await.unwrap().unwrap();
        assert_eq!(loaded.participant_name.as_deref(), Some("Ali"));
        assert_eq!(loaded.participant_username.as_deref(), Some("ali_dev"));
        assert_eq!(loaded.profile_picture_url.as_deref(), Some("https://cdn/p.jpg"));
        assert!(loaded.profile_synced_at.is_some());
    }

    #[tokio::test]
    async fn messages_round_trip_in_order() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let convo = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();

        let incoming = Message::incoming(convo.id, MessageKind::Text, "salom");
        let outgoing =
            Message::outgoing(convo.id, MessageKind::Text, "Salom!", Some(Uuid::new_v4()));
        let failed = Message::outgoing(convo.id, MessageKind::Text, "late reply", None)
            .failed("24h_window");

        store.record_message(&incoming).await.unwrap();
        store.record_message(&outgoing).await.unwrap();
        store.record_message(&failed).await.unwrap();

        let messages = store.messages_for(convo.id).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].direction, Direction::Incoming);
        assert!(messages[1].automated);
        assert_eq!(messages[2].delivery_status, DeliveryStatus::Failed);
        assert_eq!(messages[2].failure_reason.as_deref(), Some("24h_window"));
    }

    #[tokio::test]
    async fn run_log_round_trip() {
        let store = store().await;
        let acct = account();
        store.create_account(&acct).await.unwrap();
        let auto = automation(acct.id);
        store.create_automation(&auto).await.unwrap();
        let convo = store
            .get_or_create_conversation(acct.id, "psid-1")
            .await
            .unwrap();

        let run_id = store
            .record_run_started(convo.id, auto.id)
            .await
            .unwrap();
        store.record_run_finished(run_id, "completed").await.unwrap();
    }
}
