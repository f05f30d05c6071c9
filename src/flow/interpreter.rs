//! Flow graph execution.
//!
//! A run walks the validated graph with a worklist, starting from the entry
//! trigger's successors. Each visited node id is recorded for the duration
//! of the run so authored cycles terminate instead of looping. A run ends
//! when the worklist drains (completed), a collect-data node pauses it
//! (waiting), a handoff node halts it, a long delay schedules a later
//! continuation, or delivery fails in a way the run cannot recover from.

use std::collections::{HashSet, VecDeque};

use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::delivery::{DeliveryGateway, OutboundMessage, format_quick_replies};
use crate::error::{DeliveryError, Error, FlowError};
use crate::model::{
    ActionStep, Account, Automation, Conversation, ConversationStatus, LAST_QUESTION_KEY, Message,
    MessageKind, WAITING_NODE_KEY,
};
use crate::store::ConversationStore;

use super::graph::{ButtonsConfig, FlowGraph, NodeKind};
use super::template::TemplateContext;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The worklist drained; the flow reached its end.
    Completed { messages_sent: u32 },
    /// Paused on a collect-data node, waiting for the participant's reply.
    Waiting { node_id: String, field: String },
    /// Halted on a human-handoff node.
    Handoff,
    /// Paused on a delay node longer than the inline ceiling.
    Scheduled {
        node_id: String,
        resume_after: std::time::Duration,
    },
    /// The run could not proceed (no credentials, or a collect-data
    /// question that never reached the participant).
    Failed { reason: String },
}

impl RunOutcome {
    /// Label persisted in the run log.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Waiting { .. } => "waiting",
            RunOutcome::Handoff => "handoff",
            RunOutcome::Scheduled { .. } => "scheduled",
            RunOutcome::Failed { .. } => "failed",
        }
    }
}

/// Per-run inputs that don't live on the conversation.
#[derive(Debug, Clone)]
pub struct RunParams<'a> {
    pub account: &'a Account,
    pub automation_id: Uuid,
    /// Keyword that triggered the run, for `{keyword}` substitution.
    pub keyword: Option<String>,
    /// Raw text of the message being processed.
    pub text: String,
}

pub struct FlowInterpreter {
    config: EngineConfig,
    http: reqwest::Client,
}

impl FlowInterpreter {
    pub fn new(config: EngineConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.webhook_timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// Start a fresh run from the flow's entry trigger.
    pub async fn start(
        &self,
        graph: &FlowGraph,
        conversation: &mut Conversation,
        params: &RunParams<'_>,
        store: &dyn ConversationStore,
        gateway: &dyn DeliveryGateway,
    ) -> Result<RunOutcome, Error> {
        let entry = graph.entry_node().id.clone();
        let initial: Vec<String> = graph
            .out_edges(&entry)
            .iter()
            .map(|e| e.target.clone())
            .collect();
        self.execute(graph, conversation, initial, params, store, gateway)
            .await
    }

    /// Resume a waiting run with the participant's reply.
    ///
    /// Stores the reply under the pending field, clears the waiting markers,
    /// and continues from the collect-data node's successors.
    pub async fn resume_with_reply(
        &self,
        graph: &FlowGraph,
        conversation: &mut Conversation,
        reply: &str,
        params: &RunParams<'_>,
        store: &dyn ConversationStore,
        gateway: &dyn DeliveryGateway,
    ) -> Result<RunOutcome, Error> {
        let node_id = conversation
            .waiting_node_id()
            .ok_or(FlowError::NotWaiting {
                conversation_id: conversation.id,
            })?
            .to_string();
        let field = conversation
            .pending_question()
            .unwrap_or_default()
            .to_string();

        conversation
            .collected_data
            .insert(field.clone(), Value::String(reply.to_string()));
        conversation.collected_data.remove(LAST_QUESTION_KEY);
        conversation.collected_data.remove(WAITING_NODE_KEY);
        conversation.status = ConversationStatus::Active;

        store
            .update_collected_data(conversation.id, &conversation.collected_data)
            .await?;
        store
            .set_status(conversation.id, ConversationStatus::Active)
            .await?;
        debug!(field, node_id, "reply collected, resuming flow");

        self.resume_after(graph, conversation, &node_id, params, store, gateway)
            .await
    }

    /// Continue a run from the successors of `node_id` (elapsed delay or a
    /// payload navigation target's predecessor).
    pub async fn resume_after(
        &self,
        graph: &FlowGraph,
        conversation: &mut Conversation,
        node_id: &str,
        params: &RunParams<'_>,
        store: &dyn ConversationStore,
        gateway: &dyn DeliveryGateway,
    ) -> Result<RunOutcome, Error> {
        if graph.node(node_id).is_none() {
            return Err(FlowError::MissingNode {
                node_id: node_id.to_string(),
            }
            .into());
        }
        let initial: Vec<String> = graph
            .out_edges(node_id)
            .iter()
            .map(|e| e.target.clone())
            .collect();
        self.execute(graph, conversation, initial, params, store, gateway)
            .await
    }

    /// Jump directly to a node (structured `FLOW:` payload navigation) and
    /// execute it and everything downstream.
    pub async fn run_from_node(
        &self,
        graph: &FlowGraph,
        conversation: &mut Conversation,
        node_id: &str,
        params: &RunParams<'_>,
        store: &dyn ConversationStore,
        gateway: &dyn DeliveryGateway,
    ) -> Result<RunOutcome, Error> {
        if graph.node(node_id).is_none() {
            return Err(FlowError::MissingNode {
                node_id: node_id.to_string(),
            }
            .into());
        }
        self.execute(
            graph,
            conversation,
            vec![node_id.to_string()],
            params,
            store,
            gateway,
        )
        .await
    }

    /// Execute a flat action-list automation from `start_step` onward.
    ///
    /// Steps run in `order`. A per-step delay runs inline up to the ceiling;
    /// longer delays advance the step index, schedule, and hand back. Pass
    /// `skip_initial_delay` when resuming after such a delay has elapsed.
    pub async fn run_actions(
        &self,
        automation: &Automation,
        start_step: u32,
        skip_initial_delay: bool,
        conversation: &mut Conversation,
        params: &RunParams<'_>,
        store: &dyn ConversationStore,
        gateway: &dyn DeliveryGateway,
    ) -> Result<RunOutcome, Error> {
        let mut steps: Vec<&ActionStep> = automation
            .actions
            .iter()
            .filter(|s| s.order >= start_step)
            .collect();
        steps.sort_by_key(|s| s.order);
        let mut messages_sent: u32 = 0;
        let mut first = true;

        for step in steps {
            if let Some(secs) = step.delay_seconds {
                let elapsed = first && skip_initial_delay;
                let duration = std::time::Duration::from_secs(secs);
                if !elapsed {
                    if duration > self.config.max_inline_delay {
                        conversation.step_index = step.order;
                        store.advance_step(conversation.id, step.order).await?;
                        return Ok(RunOutcome::Scheduled {
                            node_id: step.order.to_string(),
                            resume_after: duration,
                        });
                    }
                    tokio::time::sleep(duration).await;
                }
            }
            first = false;

            match step.action_type.as_str() {
                "send_message" | "send_dm" => {
                    let template = step.message_template.as_deref().unwrap_or_default();
                    if !template.is_empty() {
                        let text = self.render(conversation, params, template);
                        match self
                            .deliver(
                                conversation,
                                params,
                                OutboundMessage::text(text),
                                MessageKind::Text,
                                store,
                                gateway,
                            )
                            .await?
                        {
                            SendResult::Sent => messages_sent += 1,
                            SendResult::Failed(_) => {}
                            SendResult::Halt(reason) => {
                                return Ok(RunOutcome::Failed { reason });
                            }
                        }
                    }
                }
                "send_buttons" => {
                    let text = self.render(
                        conversation,
                        params,
                        step.message_template.as_deref().unwrap_or_default(),
                    );
                    let replies =
                        format_quick_replies(step.buttons.iter().map(|b| (b.clone(), b.clone())));
                    match self
                        .deliver(
                            conversation,
                            params,
                            OutboundMessage::QuickReplies { text, replies },
                            MessageKind::Buttons,
                            store,
                            gateway,
                        )
                        .await?
                    {
                        SendResult::Sent => messages_sent += 1,
                        SendResult::Failed(_) => {}
                        SendResult::Halt(reason) => {
                            return Ok(RunOutcome::Failed { reason });
                        }
                    }
                }
                "add_tag" => {
                    if let Some(tag) = step.settings.get("tag").and_then(Value::as_str) {
                        store.add_tag(conversation.id, tag).await?;
                        if !conversation.has_tag(tag) {
                            conversation.tags.push(tag.to_string());
                        }
                    }
                }
                "remove_tag" => {
                    if let Some(tag) = step.settings.get("tag").and_then(Value::as_str) {
                        store.remove_tag(conversation.id, tag).await?;
                        conversation.tags.retain(|t| t != tag);
                    }
                }
                "webhook" => {
                    if let Some(url) = step.webhook_url.as_deref() {
                        self.post_webhook(conversation, url).await;
                    }
                }
                "human_handoff" => {
                    conversation.needs_human = true;
                    conversation.is_bot_active = false;
                    conversation.status = ConversationStatus::HumanRequested;
                    store.set_needs_human(conversation.id, true, false).await?;
                    store
                        .set_status(conversation.id, ConversationStatus::HumanRequested)
                        .await?;
                    return Ok(RunOutcome::Handoff);
                }
                other => {
                    warn!(action_type = other, "unknown action type, skipping step");
                }
            }

            conversation.step_index = step.order + 1;
            store.advance_step(conversation.id, step.order + 1).await?;
        }

        conversation.active_automation = None;
        conversation.step_index = 0;
        store.end_automation(conversation.id).await?;
        Ok(RunOutcome::Completed { messages_sent })
    }

    // ── Worklist core ───────────────────────────────────────────────

    async fn execute(
        &self,
        graph: &FlowGraph,
        conversation: &mut Conversation,
        initial: Vec<String>,
        params: &RunParams<'_>,
        store: &dyn ConversationStore,
        gateway: &dyn DeliveryGateway,
    ) -> Result<RunOutcome, Error> {
        let mut worklist: VecDeque<String> = initial.into();
        let mut visited: HashSet<String> = HashSet::new();
        let mut messages_sent: u32 = 0;

        while let Some(node_id) = worklist.pop_front() {
            if !visited.insert(node_id.clone()) {
                warn!(node_id, "cycle detected in flow, skipping revisit");
                continue;
            }
            let Some(node) = graph.node(&node_id) else {
                return Err(FlowError::MissingNode { node_id }.into());
            };

            debug!(node_id = %node.id, "executing node");
            match &node.kind {
                // A trigger reached mid-graph is just a pass-through.
                NodeKind::TriggerKeywordDm(_)
                | NodeKind::TriggerKeywordComment(_)
                | NodeKind::TriggerStoryMention
                | NodeKind::TriggerStoryReply
                | NodeKind::TriggerNewFollower
                | NodeKind::TriggerStart => {}

                NodeKind::SendDm { message } => {
                    let text = self.render(conversation, params, message);
                    match self
                        .deliver(
                            conversation,
                            params,
                            OutboundMessage::text(text),
                            MessageKind::Text,
                            store,
                            gateway,
                        )
                        .await?
                    {
                        SendResult::Sent => messages_sent += 1,
                        SendResult::Failed(_) => {}
                        SendResult::Halt(reason) => {
                            return Ok(RunOutcome::Failed { reason });
                        }
                    }
                }

                NodeKind::SendButtons(config) => {
                    let message = self.buttons_message(conversation, params, config);
                    match self
                        .deliver(
                            conversation,
                            params,
                            message,
                            MessageKind::Buttons,
                            store,
                            gateway,
                        )
                        .await?
                    {
                        SendResult::Sent => messages_sent += 1,
                        SendResult::Failed(_) => {}
                        SendResult::Halt(reason) => {
                            return Ok(RunOutcome::Failed { reason });
                        }
                    }
                }

                NodeKind::SendMedia(config) => {
                    let caption = self.render(conversation, params, &config.caption);
                    let message = OutboundMessage::Media {
                        url: config.media_url.clone(),
                        caption,
                    };
                    match self
                        .deliver(
                            conversation,
                            params,
                            message,
                            MessageKind::Media,
                            store,
                            gateway,
                        )
                        .await?
                    {
                        SendResult::Sent => messages_sent += 1,
                        SendResult::Failed(_) => {}
                        SendResult::Halt(reason) => {
                            return Ok(RunOutcome::Failed { reason });
                        }
                    }
                }

                NodeKind::SendLink(config) => {
                    let text = self.render(conversation, params, &config.message);
                    let body = if text.is_empty() {
                        config.url.clone()
                    } else {
                        format!("{text}\n{}", config.url)
                    };
                    match self
                        .deliver(
                            conversation,
                            params,
                            OutboundMessage::text(body),
                            MessageKind::Text,
                            store,
                            gateway,
                        )
                        .await?
                    {
                        SendResult::Sent => messages_sent += 1,
                        SendResult::Failed(_) => {}
                        SendResult::Halt(reason) => {
                            return Ok(RunOutcome::Failed { reason });
                        }
                    }
                }

                NodeKind::Delay(config) => {
                    let duration = config.duration();
                    if duration > self.config.max_inline_delay {
                        debug!(node_id = %node.id, ?duration, "delay exceeds inline ceiling, scheduling");
                        return Ok(RunOutcome::Scheduled {
                            node_id: node.id.clone(),
                            resume_after: duration,
                        });
                    }
                    tokio::time::sleep(duration).await;
                }

                NodeKind::AddTag { tag } => {
                    store.add_tag(conversation.id, tag).await?;
                    if !conversation.has_tag(tag) {
                        conversation.tags.push(tag.clone());
                    }
                }

                NodeKind::RemoveTag { tag } => {
                    store.remove_tag(conversation.id, tag).await?;
                    conversation.tags.retain(|t| t != tag);
                }

                NodeKind::CollectData(config) => {
                    let question = self.render(conversation, params, &config.question);
                    let field = config.field_for(&node.id);

                    match self
                        .deliver(
                            conversation,
                            params,
                            OutboundMessage::text(question),
                            MessageKind::Text,
                            store,
                            gateway,
                        )
                        .await?
                    {
                        // Waiting carries no send tally; the question is
                        // not counted.
                        SendResult::Sent => {}
                        // Pausing on a question the user never saw would
                        // strand the conversation in Waiting.
                        SendResult::Failed(reason) | SendResult::Halt(reason) => {
                            return Ok(RunOutcome::Failed { reason });
                        }
                    }

                    conversation
                        .collected_data
                        .insert(LAST_QUESTION_KEY.into(), Value::String(field.clone()));
                    conversation
                        .collected_data
                        .insert(WAITING_NODE_KEY.into(), Value::String(node.id.clone()));
                    conversation.status = ConversationStatus::Waiting;

                    store
                        .update_collected_data(conversation.id, &conversation.collected_data)
                        .await?;
                    store
                        .set_status(conversation.id, ConversationStatus::Waiting)
                        .await?;

                    return Ok(RunOutcome::Waiting {
                        node_id: node.id.clone(),
                        field,
                    });
                }

                NodeKind::HumanHandoff { message } => {
                    if !message.is_empty() {
                        let text = self.render(conversation, params, message);
                        // Best effort; the handoff happens regardless.
                        let _ = self
                            .deliver(
                                conversation,
                                params,
                                OutboundMessage::text(text),
                                MessageKind::Text,
                                store,
                                gateway,
                            )
                            .await?;
                    }
                    conversation.needs_human = true;
                    conversation.is_bot_active = false;
                    conversation.status = ConversationStatus::HumanRequested;
                    store.set_needs_human(conversation.id, true, false).await?;
                    store
                        .set_status(conversation.id, ConversationStatus::HumanRequested)
                        .await?;
                    return Ok(RunOutcome::Handoff);
                }

                NodeKind::Webhook { url } => {
                    self.post_webhook(conversation, url).await;
                }

                NodeKind::ConditionHasTag { tag } => {
                    let branch = if conversation.has_tag(tag) { "yes" } else { "no" };
                    push_branch(graph, &node.id, branch, &mut worklist);
                    continue;
                }

                NodeKind::ConditionIsFollower => {
                    // Follower state is synced into collected data with the
                    // profile; absent data resolves to the yes branch.
                    let is_follower = conversation
                        .collected_data
                        .get("_is_follower")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    let branch = if is_follower { "yes" } else { "no" };
                    push_branch(graph, &node.id, branch, &mut worklist);
                    continue;
                }

                NodeKind::ConditionCustom { rules } => {
                    let branch = if eval_custom_condition(rules, conversation) {
                        "yes"
                    } else {
                        "no"
                    };
                    push_branch(graph, &node.id, branch, &mut worklist);
                    continue;
                }
            }

            for edge in graph.out_edges(&node.id) {
                worklist.push_back(edge.target.clone());
            }
        }

        Ok(RunOutcome::Completed { messages_sent })
    }

    // ── Node helpers ────────────────────────────────────────────────

    fn render(&self, conversation: &Conversation, params: &RunParams<'_>, template: &str) -> String {
        TemplateContext::new(conversation, params.keyword.as_deref(), &params.text)
            .render(template)
    }

    fn buttons_message(
        &self,
        conversation: &Conversation,
        params: &RunParams<'_>,
        config: &ButtonsConfig,
    ) -> OutboundMessage {
        let text = self.render(conversation, params, &config.message);
        let replies = format_quick_replies(config.buttons.iter().map(|b| {
            (
                self.render(conversation, params, b.title()),
                b.payload().to_string(),
            )
        }));
        OutboundMessage::QuickReplies { text, replies }
    }

    /// Send one message, recording the outcome.
    ///
    /// Rate limits get a single retry after the advisory backoff. An expired
    /// window or an exhausted retry persists a failed message row and the
    /// traversal carries on. A missing credential halts the run; nothing can
    /// send without it.
    async fn deliver(
        &self,
        conversation: &Conversation,
        params: &RunParams<'_>,
        message: OutboundMessage,
        kind: MessageKind,
        store: &dyn ConversationStore,
        gateway: &dyn DeliveryGateway,
    ) -> Result<SendResult, Error> {
        let mut attempt = gateway
            .send(params.account, &conversation.participant_id, &message)
            .await;

        if let Err(DeliveryError::RateLimited { retry_after }) = &attempt {
            warn!(conversation_id = %conversation.id, ?retry_after, "rate limited, retrying once");
            tokio::time::sleep(*retry_after).await;
            attempt = gateway
                .send(params.account, &conversation.participant_id, &message)
                .await;
        }

        match attempt {
            Ok(receipt) => {
                let mut row = Message::outgoing(
                    conversation.id,
                    kind,
                    message.log_content(),
                    Some(params.automation_id),
                );
                row.platform_message_id = receipt.message_id;
                store.record_message(&row).await?;
                Ok(SendResult::Sent)
            }
            Err(err) => {
                let reason = err.reason_code();
                let row = Message::outgoing(
                    conversation.id,
                    kind,
                    message.log_content(),
                    Some(params.automation_id),
                )
                .failed(reason);
                store.record_message(&row).await?;
                if matches!(err, DeliveryError::CredentialMissing { .. }) {
                    warn!(conversation_id = %conversation.id, "no credentials, halting run");
                    return Ok(SendResult::Halt(reason.to_string()));
                }
                warn!(
                    conversation_id = %conversation.id,
                    reason,
                    error = %err,
                    "send failed, continuing traversal"
                );
                Ok(SendResult::Failed(reason.to_string()))
            }
        }
    }

    /// Fire-and-forget POST of the conversation snapshot to an authored
    /// webhook sink. Failures are logged, never fatal to the run.
    async fn post_webhook(&self, conversation: &Conversation, url: &str) {
        let body = json!({
            "conversation_id": conversation.id,
            "participant_id": conversation.participant_id,
            "collected_data": public_collected_data(conversation),
            "tags": conversation.tags,
        });

        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url, "webhook delivered");
            }
            Ok(resp) => {
                warn!(url, status = %resp.status(), "webhook sink rejected payload");
            }
            Err(e) => {
                warn!(url, error = %e, "webhook delivery failed");
            }
        }
    }
}

enum SendResult {
    Sent,
    /// Terminal send failure, journaled; the run keeps going.
    Failed(String),
    /// Fatal for the whole run (no credentials).
    Halt(String),
}

/// Push only the edges matching the condition's branch label. An unlabeled
/// edge counts as the yes branch.
fn push_branch(graph: &FlowGraph, node_id: &str, branch: &str, worklist: &mut VecDeque<String>) {
    for edge in graph.out_edges(node_id) {
        if edge.branch.as_deref().unwrap_or("yes") == branch {
            worklist.push_back(edge.target.clone());
        }
    }
}

/// Collected data without engine-internal `_` keys.
fn public_collected_data(conversation: &Conversation) -> serde_json::Map<String, Value> {
    conversation
        .collected_data
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Evaluate an authored custom condition against collected data.
///
/// Supported shapes: `{"field": f, "operator": "equals"|"contains"|"exists",
/// "value": v}`. A missing field or unknown operator resolves to the no
/// branch.
fn eval_custom_condition(
    rules: &serde_json::Map<String, Value>,
    conversation: &Conversation,
) -> bool {
    let Some(field) = rules.get("field").and_then(Value::as_str) else {
        return false;
    };
    let operator = rules
        .get("operator")
        .and_then(Value::as_str)
        .unwrap_or("exists");
    let actual = conversation.collected_data.get(field);

    match operator {
        "exists" => actual.is_some(),
        "equals" => match (actual, rules.get("value")) {
            (Some(a), Some(v)) => a == v,
            _ => false,
        },
        "contains" => match (actual.and_then(Value::as_str), rules.get("value").and_then(Value::as_str)) {
            (Some(a), Some(v)) => a.to_lowercase().contains(&v.to_lowercase()),
            _ => false,
        },
        _ => false,
    }
}
