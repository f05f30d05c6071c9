//! Event orchestration.
//!
//! `ChatEngine` owns the full life of an inbound event: journal it, sync the
//! participant profile, resolve the intent, dispatch to the flow interpreter
//! or a system-command handler, and log the run. Events for the same
//! conversation are serialized through a per-conversation lock so concurrent
//! webhook deliveries cannot interleave state transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, IntentPatterns};
use crate::crm::LeadService;
use crate::delivery::{DeliveryGateway, OutboundMessage, format_quick_replies};
use crate::error::{Error, StoreError};
use crate::flow::{
    DelayScheduler, FlowGraph, FlowInterpreter, ResumeDue, RunOutcome, RunParams,
};
use crate::intent::{Intent, IntentKind, IntentResolver, ResolveContext, SystemCommand};
use crate::model::{
    Account, Automation, Conversation, ConversationStatus, InboundEvent, LAST_QUESTION_KEY,
    Message, MessageKind, WAITING_NODE_KEY,
};
use crate::store::{ConversationStore, ProfileUpdate};

/// What the engine did with one inbound event.
#[derive(Debug)]
pub struct EventReport {
    pub conversation_id: Uuid,
    pub intent: Intent,
    /// Outcome of the run the event triggered or resumed, if any.
    pub outcome: Option<RunOutcome>,
    /// False when the bot is silenced and the event was journal-only.
    pub bot_active: bool,
}

pub struct ChatEngine {
    config: EngineConfig,
    store: Arc<dyn ConversationStore>,
    gateway: Arc<dyn DeliveryGateway>,
    crm: Arc<dyn LeadService>,
    resolver: IntentResolver,
    interpreter: FlowInterpreter,
    scheduler: Arc<DelayScheduler>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ChatEngine {
    /// Build the engine. The returned receiver carries elapsed delays; pass
    /// it to [`ChatEngine::spawn_resume_loop`].
    pub fn new(
        config: EngineConfig,
        patterns: IntentPatterns,
        store: Arc<dyn ConversationStore>,
        gateway: Arc<dyn DeliveryGateway>,
        crm: Arc<dyn LeadService>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ResumeDue>) {
        let (scheduler, resume_rx) = DelayScheduler::new();
        let engine = Arc::new(Self {
            interpreter: FlowInterpreter::new(config.clone()),
            resolver: IntentResolver::new(patterns),
            config,
            store,
            gateway,
            crm,
            scheduler,
            locks: Mutex::new(HashMap::new()),
        });
        (engine, resume_rx)
    }

    /// Drain elapsed delay notifications, resuming each paused run.
    pub fn spawn_resume_loop(
        self: &Arc<Self>,
        mut resume_rx: mpsc::UnboundedReceiver<ResumeDue>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(due) = resume_rx.recv().await {
                engine.scheduler.mark_resumed(due.conversation_id).await;
                if let Err(e) = engine.resume_scheduled(&due).await {
                    error!(
                        conversation_id = %due.conversation_id,
                        node_id = %due.node_id,
                        error = %e,
                        "scheduled resume failed"
                    );
                }
            }
        })
    }

    /// Process one inbound event end to end.
    pub async fn process_event(
        &self,
        account: &Account,
        event: &InboundEvent,
    ) -> Result<EventReport, Error> {
        let conversation = self
            .store
            .get_or_create_conversation(account.id, &event.sender_id)
            .await?;
        let conversation_id = conversation.id;

        let lock = self.conversation_lock(conversation_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.process_event_locked(account, event, conversation).await
        };
        self.release_conversation_lock(conversation_id, lock).await;
        result
    }

    async fn process_event_locked(
        &self,
        account: &Account,
        event: &InboundEvent,
        mut conversation: Conversation,
    ) -> Result<EventReport, Error> {
        // Re-read under the lock; a concurrent event may have advanced state
        // between the fetch and the acquire.
        if let Some(fresh) = self.store.get_conversation(conversation.id).await? {
            conversation = fresh;
        }

        // A new inbound supersedes any pending scheduled continuation.
        if self.scheduler.cancel(conversation.id).await {
            debug!(conversation_id = %conversation.id, "pending delay cancelled by new inbound");
        }

        self.journal_incoming(&conversation, event).await?;
        self.sync_profile(account, &mut conversation, event).await?;

        if !conversation.is_bot_active {
            debug!(conversation_id = %conversation.id, "bot silenced, journal only");
            return Ok(EventReport {
                conversation_id: conversation.id,
                intent: Intent::unknown(),
                outcome: None,
                bot_active: false,
            });
        }

        let automations = self.load_automations(account.id).await?;
        let intent = self.resolver.resolve(&ResolveContext {
            conversation: &conversation,
            automations: &automations,
            text: &event.message_text,
            payload: event.payload.as_deref(),
        });
        info!(
            conversation_id = %conversation.id,
            kind = ?intent.kind,
            confidence = intent.confidence,
            matched_by = intent.matched_by,
            "intent resolved"
        );

        let outcome = self
            .handle_intent(account, &mut conversation, &automations, &intent, event)
            .await?;

        Ok(EventReport {
            conversation_id: conversation.id,
            intent,
            outcome,
            bot_active: true,
        })
    }

    // ── Intent dispatch ─────────────────────────────────────────────

    async fn handle_intent(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        automations: &[(Automation, Option<FlowGraph>)],
        intent: &Intent,
        event: &InboundEvent,
    ) -> Result<Option<RunOutcome>, Error> {
        let text = event.message_text.as_str();

        match &intent.kind {
            IntentKind::FlowNavigation { node_id } => {
                let Some((automation, graph)) =
                    find_graph_with_node(conversation, automations, node_id)
                else {
                    warn!(node_id, "navigation payload references no known node");
                    return Ok(None);
                };
                let run_id = self
                    .store
                    .record_run_started(conversation.id, automation.id)
                    .await?;
                let params = RunParams {
                    account,
                    automation_id: automation.id,
                    keyword: None,
                    text: text.to_string(),
                };
                let outcome = self
                    .interpreter
                    .run_from_node(
                        graph,
                        conversation,
                        node_id,
                        &params,
                        self.store.as_ref(),
                        self.gateway.as_ref(),
                    )
                    .await?;
                self.store
                    .record_run_finished(run_id, outcome.label())
                    .await?;
                self.apply_outcome(conversation, automation.id, &outcome)
                    .await?;
                Ok(Some(outcome))
            }

            IntentKind::StartAutomation { automation_id } => {
                let Some((automation, graph)) = automations
                    .iter()
                    .find(|(a, _)| a.id == *automation_id)
                    .map(|(a, g)| (a, g.as_ref()))
                else {
                    warn!(%automation_id, "start payload references no active automation");
                    return Ok(None);
                };
                let outcome = self
                    .start_run(account, conversation, automation, graph, None, text)
                    .await?;
                Ok(Some(outcome))
            }

            IntentKind::CustomAction { action } => {
                // Custom actions are tagged onto the conversation for the
                // operator dashboard; the engine itself has no handler.
                let tag = format!("action:{action}");
                self.store.add_tag(conversation.id, &tag).await?;
                if !conversation.has_tag(&tag) {
                    conversation.tags.push(tag);
                }
                Ok(None)
            }

            IntentKind::Payload { payload } => {
                if conversation.is_waiting() {
                    let outcome = self
                        .resume_waiting(account, conversation, automations, payload)
                        .await?;
                    return Ok(outcome);
                }
                // A bare button payload from an older message may still spell
                // a trigger keyword.
                if let Some((automation, graph, keyword)) = find_trigger(automations, payload) {
                    let outcome = self
                        .start_run(account, conversation, automation, graph, keyword, payload)
                        .await?;
                    return Ok(Some(outcome));
                }
                debug!(payload, "unmatched payload, no action");
                Ok(None)
            }

            IntentKind::SystemCommand {
                command,
                additional_text,
            } => {
                self.handle_system_command(
                    account,
                    conversation,
                    automations,
                    *command,
                    additional_text.as_deref(),
                )
                .await
            }

            IntentKind::Complaint { category } => {
                self.crm_update_intent(conversation, intent).await;
                info!(conversation_id = %conversation.id, category, "complaint escalated");
                self.send_reply(
                    account,
                    conversation,
                    "Uzr so'raymiz! Murojaatingiz operatorga uzatildi.",
                )
                .await?;
                self.escalate(conversation, "complaint").await?;
                Ok(None)
            }

            IntentKind::UserInput | IntentKind::CollectedResponse { .. } => {
                let outcome = self
                    .resume_waiting(account, conversation, automations, text)
                    .await?;
                Ok(outcome)
            }

            IntentKind::TriggerMatch {
                automation_id,
                keyword,
            } => {
                let Some((automation, graph)) = automations
                    .iter()
                    .find(|(a, _)| a.id == *automation_id)
                    .map(|(a, g)| (a, g.as_ref()))
                else {
                    return Ok(None);
                };
                let outcome = self
                    .start_run(account, conversation, automation, graph, keyword.clone(), text)
                    .await?;
                Ok(Some(outcome))
            }

            IntentKind::General { category } => {
                // No authored response for general categories; they feed the
                // CRM and the operator dashboard.
                debug!(conversation_id = %conversation.id, category, "general intent, journal only");
                self.crm_update_intent(conversation, intent).await;
                Ok(None)
            }

            IntentKind::Unknown => {
                if intent.confidence < self.config.fallback_confidence_threshold {
                    info!(conversation_id = %conversation.id, "unresolved intent, escalating");
                    self.escalate(conversation, "unresolved_intent").await?;
                }
                Ok(None)
            }
        }
    }

    async fn handle_system_command(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        automations: &[(Automation, Option<FlowGraph>)],
        command: SystemCommand,
        additional_text: Option<&str>,
    ) -> Result<Option<RunOutcome>, Error> {
        match command {
            SystemCommand::StartFlow => {
                // "start <keyword>" picks the matching automation; a bare
                // "start" falls back to the first active one.
                let target = additional_text
                    .and_then(|t| find_trigger(automations, t))
                    .or_else(|| {
                        automations
                            .first()
                            .map(|(a, g)| (a, g.as_ref(), None))
                    });
                let Some((automation, graph, keyword)) = target else {
                    debug!("start command with no active automations");
                    return Ok(None);
                };
                let text = additional_text.unwrap_or_default();
                let outcome = self
                    .start_run(account, conversation, automation, graph, keyword, text)
                    .await?;
                Ok(Some(outcome))
            }

            SystemCommand::StopFlow => {
                self.detach_run(conversation).await?;
                self.send_reply(account, conversation, "Bekor qilindi.").await?;
                Ok(None)
            }

            SystemCommand::HumanHandoff => {
                self.send_reply(
                    account,
                    conversation,
                    "Operator tez orada siz bilan bog'lanadi.",
                )
                .await?;
                self.escalate(conversation, "operator_requested").await?;
                Ok(None)
            }

            SystemCommand::MainMenu => {
                let options: Vec<(String, String)> = automations
                    .iter()
                    .map(|(a, _)| (a.name.clone(), format!("AUTOMATION:{}", a.id)))
                    .collect();
                let (message, kind) = if options.is_empty() {
                    (
                        OutboundMessage::text("Hozircha menyu bo'sh."),
                        MessageKind::Text,
                    )
                } else {
                    (
                        OutboundMessage::QuickReplies {
                            text: "Nimadan boshlaymiz?".to_string(),
                            replies: format_quick_replies(options),
                        },
                        MessageKind::Buttons,
                    )
                };
                self.send_message(account, conversation, message, kind)
                    .await?;
                Ok(None)
            }

            // Flows carry no history stack, so "back" is acknowledged and
            // otherwise ignored.
            SystemCommand::GoBack => {
                debug!(conversation_id = %conversation.id, "go_back acknowledged, no-op");
                Ok(None)
            }
        }
    }

    // ── Run plumbing ────────────────────────────────────────────────

    /// Start an automation on the conversation: bump the trigger counter,
    /// attach it, run to an outcome, and log the run.
    async fn start_run(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        automation: &Automation,
        graph: Option<&FlowGraph>,
        keyword: Option<String>,
        text: &str,
    ) -> Result<RunOutcome, Error> {
        self.store.increment_trigger_count(automation.id).await?;
        self.store
            .start_automation(conversation.id, automation.id)
            .await?;
        conversation.active_automation = Some(automation.id);
        conversation.step_index = 0;
        conversation.status = ConversationStatus::Active;

        let run_id = self
            .store
            .record_run_started(conversation.id, automation.id)
            .await?;
        let params = RunParams {
            account,
            automation_id: automation.id,
            keyword,
            text: text.to_string(),
        };
        let outcome = match graph {
            Some(graph) => {
                self.interpreter
                    .start(
                        graph,
                        conversation,
                        &params,
                        self.store.as_ref(),
                        self.gateway.as_ref(),
                    )
                    .await?
            }
            None => {
                self.interpreter
                    .run_actions(
                        automation,
                        0,
                        false,
                        conversation,
                        &params,
                        self.store.as_ref(),
                        self.gateway.as_ref(),
                    )
                    .await?
            }
        };
        self.store
            .record_run_finished(run_id, outcome.label())
            .await?;
        self.apply_outcome(conversation, automation.id, &outcome)
            .await?;
        Ok(outcome)
    }

    /// Feed the participant's reply into the waiting flow.
    async fn resume_waiting(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        automations: &[(Automation, Option<FlowGraph>)],
        reply: &str,
    ) -> Result<Option<RunOutcome>, Error> {
        let Some((automation, Some(graph))) = conversation
            .active_automation
            .and_then(|id| automations.iter().find(|(a, _)| a.id == id))
            .map(|(a, g)| (a, g.as_ref()))
        else {
            // The automation was deactivated or its flow no longer loads.
            // Clear the stale waiting state instead of trapping the user.
            warn!(
                conversation_id = %conversation.id,
                "waiting conversation has no loadable flow, clearing state"
            );
            self.detach_run(conversation).await?;
            return Ok(None);
        };

        let run_id = self
            .store
            .record_run_started(conversation.id, automation.id)
            .await?;
        let params = RunParams {
            account,
            automation_id: automation.id,
            keyword: None,
            text: reply.to_string(),
        };
        let outcome = self
            .interpreter
            .resume_with_reply(
                graph,
                conversation,
                reply,
                &params,
                self.store.as_ref(),
                self.gateway.as_ref(),
            )
            .await?;
        self.store
            .record_run_finished(run_id, outcome.label())
            .await?;
        self.apply_outcome(conversation, automation.id, &outcome)
            .await?;
        Ok(Some(outcome))
    }

    /// Continue a run whose delay elapsed.
    async fn resume_scheduled(&self, due: &ResumeDue) -> Result<(), Error> {
        let lock = self.conversation_lock(due.conversation_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.resume_scheduled_locked(due).await
        };
        self.release_conversation_lock(due.conversation_id, lock).await;
        result
    }

    async fn resume_scheduled_locked(&self, due: &ResumeDue) -> Result<(), Error> {
        let Some(mut conversation) = self.store.get_conversation(due.conversation_id).await? else {
            return Ok(());
        };
        if !conversation.is_bot_active {
            debug!(conversation_id = %conversation.id, "bot silenced, dropping scheduled resume");
            return Ok(());
        }
        let Some(automation_id) = conversation.active_automation else {
            return Ok(());
        };
        let Some(automation) = self.store.get_automation(automation_id).await? else {
            return Ok(());
        };
        let Some(account) = self.store.get_account(conversation.account_id).await? else {
            return Ok(());
        };

        let run_id = self
            .store
            .record_run_started(conversation.id, automation.id)
            .await?;
        let params = RunParams {
            account: &account,
            automation_id: automation.id,
            keyword: None,
            text: String::new(),
        };
        let outcome = match &automation.flow {
            Some(def) => {
                let graph = FlowGraph::load(def)?;
                self.interpreter
                    .resume_after(
                        &graph,
                        &mut conversation,
                        &due.node_id,
                        &params,
                        self.store.as_ref(),
                        self.gateway.as_ref(),
                    )
                    .await?
            }
            None => {
                let step = due.node_id.parse::<u32>().unwrap_or(conversation.step_index);
                self.interpreter
                    .run_actions(
                        &automation,
                        step,
                        true,
                        &mut conversation,
                        &params,
                        self.store.as_ref(),
                        self.gateway.as_ref(),
                    )
                    .await?
            }
        };
        self.store
            .record_run_finished(run_id, outcome.label())
            .await?;
        self.apply_outcome(&mut conversation, automation.id, &outcome)
            .await
    }

    /// Post-run bookkeeping shared by every run entry point.
    async fn apply_outcome(
        &self,
        conversation: &mut Conversation,
        automation_id: Uuid,
        outcome: &RunOutcome,
    ) -> Result<(), Error> {
        match outcome {
            RunOutcome::Completed { .. } => {
                self.store.end_automation(conversation.id).await?;
                conversation.active_automation = None;
                self.store.increment_conversion_count(automation_id).await?;
                self.report_collected(conversation).await;
            }
            RunOutcome::Waiting { .. } => {}
            RunOutcome::Scheduled {
                node_id,
                resume_after,
            } => {
                self.scheduler
                    .schedule(conversation.id, node_id.clone(), *resume_after)
                    .await;
            }
            RunOutcome::Handoff => {
                self.store.end_automation(conversation.id).await?;
                conversation.active_automation = None;
                self.crm_handoff(conversation, "flow_handoff").await;
            }
            RunOutcome::Failed { reason } => {
                warn!(conversation_id = %conversation.id, reason, "run failed");
                self.store.end_automation(conversation.id).await?;
                conversation.active_automation = None;
            }
        }
        Ok(())
    }

    // ── State helpers ───────────────────────────────────────────────

    async fn journal_incoming(
        &self,
        conversation: &Conversation,
        event: &InboundEvent,
    ) -> Result<(), StoreError> {
        let content = if event.message_text.is_empty() {
            event.payload.clone().unwrap_or_default()
        } else {
            event.message_text.clone()
        };
        let mut row = Message::incoming(conversation.id, event.message_kind(), content);
        row.platform_message_id = event.message_id.clone();
        self.store.record_message(&row).await?;
        self.store
            .touch_last_message(conversation.id, Utc::now())
            .await
    }

    /// Refresh the participant profile from the platform when stale, falling
    /// back to whatever the webhook carried.
    async fn sync_profile(
        &self,
        account: &Account,
        conversation: &mut Conversation,
        event: &InboundEvent,
    ) -> Result<(), Error> {
        if !conversation.profile_is_stale(self.config.profile_freshness) {
            return Ok(());
        }

        let update = match self
            .gateway
            .fetch_profile(account, &conversation.participant_id)
            .await
        {
            Ok(profile) => {
                if let Some(follows) = profile.is_follower {
                    conversation
                        .collected_data
                        .insert("_is_follower".into(), Value::Bool(follows));
                    self.store
                        .update_collected_data(conversation.id, &conversation.collected_data)
                        .await?;
                }
                ProfileUpdate {
                    username: profile.username,
                    name: profile.name,
                    profile_picture_url: profile.profile_picture_url,
                    synced_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "profile fetch failed, using webhook fields"
                );
                if event.sender_username.is_none() && event.sender_name.is_none() {
                    return Ok(());
                }
                ProfileUpdate {
                    username: event.sender_username.clone(),
                    name: event.sender_name.clone(),
                    profile_picture_url: None,
                    synced_at: Utc::now(),
                }
            }
        };

        self.store.update_profile(conversation.id, &update).await?;
        if update.username.is_some() {
            conversation.participant_username = update.username;
        }
        if update.name.is_some() {
            conversation.participant_name = update.name;
        }
        conversation.profile_synced_at = Some(update.synced_at);
        Ok(())
    }

    /// Detach the active automation and clear any waiting markers.
    async fn detach_run(&self, conversation: &mut Conversation) -> Result<(), Error> {
        self.scheduler.cancel(conversation.id).await;
        conversation.collected_data.remove(LAST_QUESTION_KEY);
        conversation.collected_data.remove(WAITING_NODE_KEY);
        conversation.active_automation = None;
        conversation.step_index = 0;
        conversation.status = ConversationStatus::Active;
        self.store
            .update_collected_data(conversation.id, &conversation.collected_data)
            .await?;
        self.store.end_automation(conversation.id).await?;
        self.store
            .set_status(conversation.id, ConversationStatus::Active)
            .await?;
        Ok(())
    }

    /// Route the conversation to a person and silence the bot.
    async fn escalate(&self, conversation: &mut Conversation, reason: &str) -> Result<(), Error> {
        conversation.needs_human = true;
        conversation.is_bot_active = false;
        conversation.status = ConversationStatus::HumanRequested;
        self.store
            .set_needs_human(conversation.id, true, false)
            .await?;
        self.store
            .set_status(conversation.id, ConversationStatus::HumanRequested)
            .await?;
        self.crm_handoff(conversation, reason).await;
        Ok(())
    }

    async fn send_reply(
        &self,
        account: &Account,
        conversation: &Conversation,
        text: &str,
    ) -> Result<(), Error> {
        self.send_message(
            account,
            conversation,
            OutboundMessage::text(text),
            MessageKind::Text,
        )
        .await
    }

    /// Send a system response outside any automation run. Failures are
    /// journaled, never fatal to event processing.
    async fn send_message(
        &self,
        account: &Account,
        conversation: &Conversation,
        message: OutboundMessage,
        kind: MessageKind,
    ) -> Result<(), Error> {
        match self
            .gateway
            .send(account, &conversation.participant_id, &message)
            .await
        {
            Ok(receipt) => {
                let mut row =
                    Message::outgoing(conversation.id, kind, message.log_content(), None);
                row.platform_message_id = receipt.message_id;
                self.store.record_message(&row).await?;
            }
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "system reply failed");
                let row = Message::outgoing(conversation.id, kind, message.log_content(), None)
                    .failed(e.reason_code());
                self.store.record_message(&row).await?;
            }
        }
        Ok(())
    }

    async fn load_automations(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<(Automation, Option<FlowGraph>)>, Error> {
        let mut automations = Vec::new();
        for automation in self.store.active_automations(account_id).await? {
            let graph = match &automation.flow {
                Some(def) => match FlowGraph::load(def) {
                    Ok(graph) => Some(graph),
                    Err(e) => {
                        // An unloadable flow must not take the account down;
                        // the automation just cannot trigger.
                        warn!(automation_id = %automation.id, error = %e, "flow failed validation, skipping");
                        continue;
                    }
                },
                None => None,
            };
            automations.push((automation, graph));
        }
        Ok(automations)
    }

    async fn conversation_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id).or_default())
    }

    /// Return a lock handle and evict the map entry once no other task holds
    /// one. Handles are only cloned under the map mutex, so the count cannot
    /// rise between the check and the removal.
    async fn release_conversation_lock(&self, id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().await;
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    // ── CRM reporting (best effort) ─────────────────────────────────

    async fn report_collected(&self, conversation: &Conversation) {
        let data: serde_json::Map<String, Value> = conversation
            .collected_data
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if data.is_empty() {
            return;
        }
        if let Err(e) = self.crm.create_from_chatbot(conversation).await {
            warn!(conversation_id = %conversation.id, error = %e, "lead creation failed");
            return;
        }
        if let Err(e) = self.crm.append_chatbot_data(conversation.id, &data).await {
            warn!(conversation_id = %conversation.id, error = %e, "lead data append failed");
        }
    }

    async fn crm_update_intent(&self, conversation: &Conversation, intent: &Intent) {
        if let Err(e) = self.crm.update_intent(conversation.id, intent).await {
            warn!(conversation_id = %conversation.id, error = %e, "lead intent update failed");
        }
    }

    async fn crm_handoff(&self, conversation: &Conversation, reason: &str) {
        if let Err(e) = self.crm.create_from_chatbot(conversation).await {
            warn!(conversation_id = %conversation.id, error = %e, "lead creation failed");
        }
        if let Err(e) = self.crm.notify_handoff(conversation, reason).await {
            warn!(conversation_id = %conversation.id, error = %e, "handoff notification failed");
        }
    }
}

/// Find the graph that can satisfy a `FLOW:` navigation payload: the active
/// automation's flow first, then any active flow containing the node.
fn find_graph_with_node<'a>(
    conversation: &Conversation,
    automations: &'a [(Automation, Option<FlowGraph>)],
    node_id: &str,
) -> Option<(&'a Automation, &'a FlowGraph)> {
    if let Some(active) = conversation.active_automation {
        if let Some((automation, Some(graph))) = automations
            .iter()
            .find(|(a, _)| a.id == active)
            .map(|(a, g)| (a, g.as_ref()))
        {
            if graph.node(node_id).is_some() {
                return Some((automation, graph));
            }
        }
    }
    automations.iter().find_map(|(a, g)| {
        let graph = g.as_ref()?;
        graph.node(node_id).map(|_| (a, graph))
    })
}

/// Match `text` against every active automation's triggers, returning the
/// first hit with the matched keyword.
fn find_trigger<'a>(
    automations: &'a [(Automation, Option<FlowGraph>)],
    text: &str,
) -> Option<(&'a Automation, Option<&'a FlowGraph>, Option<String>)> {
    for (automation, graph) in automations {
        for trigger in &automation.triggers {
            if let Some(keyword) = trigger.matching_keyword(text) {
                return Some((automation, graph.as_ref(), Some(keyword.to_string())));
            }
        }
        if let Some(graph) = graph {
            if let Some(keywords) = graph.trigger_keywords() {
                if let Some((keyword, _)) = keywords.match_text(text) {
                    return Some((automation, Some(graph), Some(keyword.to_string())));
                }
                if keywords.matches_all() {
                    return Some((automation, Some(graph), None));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::NullLeadService;
    use crate::delivery::{DeliveryReceipt, ParticipantProfile};
    use crate::error::DeliveryError;
    use crate::model::{ActionStep, AutomationStatus, TriggerDef, TriggerType};
    use crate::store::LibSqlStore;

    fn flat(keywords: &[&str]) -> (Automation, Option<FlowGraph>) {
        (
            Automation {
                id: Uuid::new_v4(),
                account_id: Uuid::new_v4(),
                name: "flat".into(),
                status: AutomationStatus::Active,
                triggers: vec![TriggerDef {
                    trigger_type: TriggerType::KeywordDm,
                    keywords: keywords.iter().map(|k| k.to_string()).collect(),
                    case_sensitive: false,
                    exact_match: false,
                }],
                actions: vec![ActionStep {
                    order: 0,
                    action_type: "send_message".into(),
                    message_template: Some("ok".into()),
                    buttons: Vec::new(),
                    delay_seconds: None,
                    webhook_url: None,
                    settings: serde_json::Map::new(),
                }],
                flow: None,
                trigger_count: 0,
                conversion_count: 0,
            },
            None,
        )
    }

    struct SilentGateway;

    #[async_trait::async_trait]
    impl DeliveryGateway for SilentGateway {
        async fn send(
            &self,
            _account: &Account,
            _recipient_id: &str,
            _message: &OutboundMessage,
        ) -> Result<DeliveryReceipt, DeliveryError> {
            Ok(DeliveryReceipt::default())
        }

        async fn fetch_profile(
            &self,
            _account: &Account,
            _participant_id: &str,
        ) -> Result<ParticipantProfile, DeliveryError> {
            Ok(ParticipantProfile::default())
        }
    }

    #[tokio::test]
    async fn conversation_lock_entry_evicted_after_processing() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let account = Account {
            id: Uuid::new_v4(),
            platform_id: "page_t".into(),
            username: None,
        };
        store.create_account(&account).await.unwrap();

        let (engine, _resume_rx) = ChatEngine::new(
            EngineConfig::default(),
            IntentPatterns::default(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Arc::new(SilentGateway),
            Arc::new(NullLeadService),
        );

        engine
            .process_event(&account, &InboundEvent::message("psid-1", "salom"))
            .await
            .unwrap();

        assert!(engine.locks.lock().await.is_empty());
    }

    #[test]
    fn find_trigger_returns_match_and_keyword() {
        let automations = vec![flat(&["narx"]), flat(&["kurs"])];
        let (automation, _, keyword) = find_trigger(&automations, "kurs haqida").unwrap();
        assert_eq!(automation.id, automations[1].0.id);
        assert_eq!(keyword.as_deref(), Some("kurs"));

        assert!(find_trigger(&automations, "salom").is_none());
    }

    #[test]
    fn find_graph_prefers_active_automation() {
        use crate::model::{FlowDefinition, FlowEdgeDef, FlowNodeDef};
        use serde_json::json;

        let def = FlowDefinition {
            nodes: vec![
                FlowNodeDef {
                    node_id: "t".into(),
                    node_type: "trigger_keyword_dm".into(),
                    data: json!({"keywords": ["hi"]}).as_object().cloned().unwrap(),
                },
                FlowNodeDef {
                    node_id: "a".into(),
                    node_type: "action_send_dm".into(),
                    data: json!({"message": "x"}).as_object().cloned().unwrap(),
                },
            ],
            edges: vec![FlowEdgeDef {
                source_node_id: "t".into(),
                target_node_id: "a".into(),
                source_handle: None,
            }],
        };
        let graph = FlowGraph::load(&def).unwrap();
        let mut automation = flat(&["x"]).0;
        automation.flow = Some(def);
        let automations = vec![(automation, Some(graph))];

        let conversation = Conversation::new(Uuid::new_v4(), "psid");
        let hit = find_graph_with_node(&conversation, &automations, "a");
        assert!(hit.is_some());
        assert!(find_graph_with_node(&conversation, &automations, "ghost").is_none());
    }
}
