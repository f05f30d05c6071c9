//! End-to-end engine scenarios: webhook event in, platform sends out,
//! against an in-memory store and a recording gateway.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use convoflow::config::{EngineConfig, IntentPatterns};
use convoflow::crm::LeadService;
use convoflow::delivery::{
    DeliveryGateway, DeliveryReceipt, OutboundMessage, ParticipantProfile,
};
use convoflow::engine::ChatEngine;
use convoflow::error::DeliveryError;
use convoflow::flow::{ResumeDue, RunOutcome};
use convoflow::intent::{Intent, IntentKind};
use convoflow::model::{
    Account, Automation, AutomationStatus, ConversationStatus, DeliveryStatus, Direction,
    FlowDefinition, FlowEdgeDef, FlowNodeDef, InboundEvent, TriggerDef, TriggerType,
};
use convoflow::store::{ConversationStore, LibSqlStore};

// ── Test doubles ────────────────────────────────────────────────────

struct MockGateway {
    sent: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<Vec<DeliveryError>>,
}

impl MockGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        })
    }

    fn failing_with(errors: Vec<DeliveryError>) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(errors),
        })
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(OutboundMessage::log_content)
            .collect()
    }
}

#[async_trait]
impl DeliveryGateway for MockGateway {
    async fn send(
        &self,
        _account: &Account,
        _recipient_id: &str,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut failures = self.failures.lock().unwrap();
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        drop(failures);
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryReceipt {
            message_id: Some("mid.test".into()),
        })
    }

    async fn fetch_profile(
        &self,
        _account: &Account,
        _participant_id: &str,
    ) -> Result<ParticipantProfile, DeliveryError> {
        Ok(ParticipantProfile {
            username: Some("ali_uz".into()),
            name: Some("Ali Valiyev".into()),
            profile_picture_url: None,
            is_follower: Some(true),
        })
    }
}

#[derive(Default)]
struct RecordingCrm {
    handoffs: Mutex<Vec<String>>,
    intents: Mutex<Vec<String>>,
}

#[async_trait]
impl LeadService for RecordingCrm {
    async fn create_from_chatbot(
        &self,
        _conversation: &convoflow::model::Conversation,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn append_chatbot_data(
        &self,
        _conversation_id: Uuid,
        _data: &serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_intent(&self, _conversation_id: Uuid, intent: &Intent) -> anyhow::Result<()> {
        self.intents
            .lock()
            .unwrap()
            .push(format!("{:?}", intent.kind));
        Ok(())
    }

    async fn notify_handoff(
        &self,
        _conversation: &convoflow::model::Conversation,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.handoffs.lock().unwrap().push(reason.to_string());
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

struct World {
    engine: Arc<ChatEngine>,
    resume_rx: Option<tokio::sync::mpsc::UnboundedReceiver<ResumeDue>>,
    store: Arc<LibSqlStore>,
    gateway: Arc<MockGateway>,
    crm: Arc<RecordingCrm>,
    account: Account,
}

async fn world_with(gateway: Arc<MockGateway>) -> World {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let account = Account {
        id: Uuid::new_v4(),
        platform_id: "page_1".into(),
        username: Some("shop_uz".into()),
    };
    store.create_account(&account).await.unwrap();

    let crm = Arc::new(RecordingCrm::default());
    let (engine, resume_rx) = ChatEngine::new(
        EngineConfig::default(),
        IntentPatterns::default(),
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        Arc::clone(&gateway) as Arc<dyn DeliveryGateway>,
        Arc::clone(&crm) as Arc<dyn LeadService>,
    );
    World {
        engine,
        resume_rx: Some(resume_rx),
        store,
        gateway,
        crm,
        account,
    }
}

async fn world() -> World {
    world_with(MockGateway::new()).await
}

fn node(id: &str, node_type: &str, data: serde_json::Value) -> FlowNodeDef {
    FlowNodeDef {
        node_id: id.into(),
        node_type: node_type.into(),
        data: data.as_object().cloned().unwrap_or_default(),
    }
}

fn edge(source: &str, target: &str) -> FlowEdgeDef {
    FlowEdgeDef {
        source_node_id: source.into(),
        target_node_id: target.into(),
        source_handle: None,
    }
}

fn flow_automation(account_id: Uuid, name: &str, flow: FlowDefinition) -> Automation {
    Automation {
        id: Uuid::new_v4(),
        account_id,
        name: name.into(),
        status: AutomationStatus::Active,
        triggers: Vec::new(),
        actions: Vec::new(),
        flow: Some(flow),
        trigger_count: 0,
        conversion_count: 0,
    }
}

/// salom → two DMs.
fn greeting_flow(account_id: Uuid) -> Automation {
    flow_automation(
        account_id,
        "greeting",
        FlowDefinition {
            nodes: vec![
                node("t", "trigger_keyword_dm", json!({"keywords": ["salom"]})),
                node("a", "action_send_dm", json!({"message": "Salom {name}!"})),
                node("b", "action_send_dm", json!({"message": "Nima kerak?"})),
            ],
            edges: vec![edge("t", "a"), edge("a", "b")],
        },
    )
}

/// kurs → ask for a phone number, thank after the reply.
fn collect_flow(account_id: Uuid) -> Automation {
    flow_automation(
        account_id,
        "enroll",
        FlowDefinition {
            nodes: vec![
                node("t", "trigger_keyword_dm", json!({"keywords": ["kurs"]})),
                node(
                    "q",
                    "action_collect_data",
                    json!({"question": "Telefon raqamingiz?", "field_name": "phone"}),
                ),
                node("done", "action_send_dm", json!({"message": "Rahmat, {phone}!"})),
            ],
            edges: vec![edge("t", "q"), edge("q", "done")],
        },
    )
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn keyword_event_triggers_flow_and_counts() {
    let w = world().await;
    let automation = greeting_flow(w.account.id);
    w.store.create_automation(&automation).await.unwrap();

    let report = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "salom"))
        .await
        .unwrap();

    assert!(matches!(report.intent.kind, IntentKind::TriggerMatch { .. }));
    assert_eq!(report.outcome, Some(RunOutcome::Completed { messages_sent: 2 }));
    // Profile was synced before the run, so {name} resolved.
    assert_eq!(
        w.gateway.sent_texts(),
        vec!["Salom Ali Valiyev!", "Nima kerak?"]
    );

    let stored = w.store.get_automation(automation.id).await.unwrap().unwrap();
    assert_eq!(stored.trigger_count, 1);
    assert_eq!(stored.conversion_count, 1);

    // Incoming and both outgoing messages journaled.
    let messages = w.store.messages_for(report.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].direction, Direction::Incoming);
}

#[tokio::test]
async fn collect_data_round_trip_across_events() {
    let w = world().await;
    w.store
        .create_automation(&collect_flow(w.account.id))
        .await
        .unwrap();

    let first = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "kurs"))
        .await
        .unwrap();
    assert!(matches!(first.outcome, Some(RunOutcome::Waiting { .. })));

    let conversation = w
        .store
        .get_conversation(first.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.status, ConversationStatus::Waiting);

    let second = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "+998901234567"))
        .await
        .unwrap();
    // A reply to a waiting run classifies as plain user input; the
    // interpreter itself binds it to the pending field.
    assert_eq!(second.intent.kind, IntentKind::UserInput);
    assert!(matches!(second.outcome, Some(RunOutcome::Completed { .. })));

    let conversation = w
        .store
        .get_conversation(first.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.status, ConversationStatus::Active);
    assert!(conversation.active_automation.is_none());
    assert_eq!(
        conversation.collected_data.get("phone").and_then(|v| v.as_str()),
        Some("+998901234567")
    );
    assert!(conversation.collected_data.get("_last_question").is_none());

    // The reply was substituted into the confirmation.
    assert!(w
        .gateway
        .sent_texts()
        .contains(&"Rahmat, +998901234567!".to_string()));
}

#[tokio::test]
async fn silenced_bot_journals_without_responding() {
    let w = world().await;
    w.store
        .create_automation(&greeting_flow(w.account.id))
        .await
        .unwrap();

    let conversation = w
        .store
        .get_or_create_conversation(w.account.id, "psid-1")
        .await
        .unwrap();
    w.store
        .set_needs_human(conversation.id, true, false)
        .await
        .unwrap();

    let report = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "salom"))
        .await
        .unwrap();

    assert!(!report.bot_active);
    assert!(report.outcome.is_none());
    assert!(w.gateway.sent_texts().is_empty());
    // The inbound message itself was still journaled.
    let messages = w.store.messages_for(conversation.id).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn operator_command_escalates_and_notifies_crm() {
    let w = world().await;

    let report = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "operator"))
        .await
        .unwrap();

    assert!(matches!(
        report.intent.kind,
        IntentKind::SystemCommand { .. }
    ));
    let conversation = w
        .store
        .get_conversation(report.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(conversation.needs_human);
    assert!(!conversation.is_bot_active);
    assert_eq!(conversation.status, ConversationStatus::HumanRequested);
    assert_eq!(
        w.crm.handoffs.lock().unwrap().as_slice(),
        ["operator_requested"]
    );
    // The acknowledgement went out before the bot went quiet.
    assert_eq!(w.gateway.sent_texts().len(), 1);
}

#[tokio::test]
async fn complaint_escalates_with_category() {
    let w = world().await;

    let report = w
        .engine
        .process_event(
            &w.account,
            &InboundEvent::message("psid-1", "mahsulot buzuq keldi"),
        )
        .await
        .unwrap();

    assert!(matches!(
        report.intent.kind,
        IntentKind::Complaint { ref category } if category == "defect"
    ));
    let conversation = w
        .store
        .get_conversation(report.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(conversation.needs_human);
    assert_eq!(w.crm.intents.lock().unwrap().len(), 1);
    assert_eq!(w.crm.handoffs.lock().unwrap().as_slice(), ["complaint"]);
    // Apology went out before the escalation silenced the bot.
    assert_eq!(w.gateway.sent_texts().len(), 1);
}

#[tokio::test]
async fn start_payload_launches_referenced_automation() {
    let w = world().await;
    let automation = greeting_flow(w.account.id);
    w.store.create_automation(&automation).await.unwrap();

    let report = w
        .engine
        .process_event(
            &w.account,
            &InboundEvent::message("psid-1", "")
                .with_payload(format!("AUTOMATION:{}", automation.id)),
        )
        .await
        .unwrap();

    assert!(matches!(
        report.intent.kind,
        IntentKind::StartAutomation { .. }
    ));
    assert_eq!(report.outcome, Some(RunOutcome::Completed { messages_sent: 2 }));
}

#[tokio::test]
async fn flow_payload_jumps_to_node() {
    let w = world().await;
    w.store
        .create_automation(&greeting_flow(w.account.id))
        .await
        .unwrap();

    let report = w
        .engine
        .process_event(
            &w.account,
            &InboundEvent::message("psid-1", "").with_payload("FLOW:b"),
        )
        .await
        .unwrap();

    assert!(matches!(
        report.intent.kind,
        IntentKind::FlowNavigation { .. }
    ));
    // Only the jumped-to node and its successors ran.
    assert_eq!(w.gateway.sent_texts(), vec!["Nima kerak?"]);
}

#[tokio::test]
async fn expired_window_journals_failure_and_flow_continues() {
    let gateway = MockGateway::failing_with(vec![DeliveryError::ExpiredWindow {
        recipient: "psid-1".into(),
        message: "outside of allowed window".into(),
    }]);
    let w = world_with(gateway).await;
    w.store
        .create_automation(&greeting_flow(w.account.id))
        .await
        .unwrap();

    let report = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "salom"))
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Completed { messages_sent: 1 }));
    let messages = w.store.messages_for(report.conversation_id).await.unwrap();
    let failed: Vec<_> = messages
        .iter()
        .filter(|m| m.delivery_status == DeliveryStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure_reason.as_deref(), Some("24h_window"));
    // The second DM still went out.
    assert_eq!(w.gateway.sent_texts(), vec!["Nima kerak?"]);
}

#[tokio::test]
async fn unresolved_message_escalates_to_human() {
    let w = world().await;

    let report = w
        .engine
        .process_event(
            &w.account,
            &InboundEvent::message("psid-1", "xxyyzz qwerty"),
        )
        .await
        .unwrap();

    assert_eq!(report.intent.kind, IntentKind::Unknown);
    let conversation = w
        .store
        .get_conversation(report.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(conversation.needs_human);
    assert_eq!(
        w.crm.handoffs.lock().unwrap().as_slice(),
        ["unresolved_intent"]
    );
}

#[tokio::test]
async fn stop_command_detaches_waiting_run() {
    let w = world().await;
    w.store
        .create_automation(&collect_flow(w.account.id))
        .await
        .unwrap();

    let first = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "kurs"))
        .await
        .unwrap();
    assert!(matches!(first.outcome, Some(RunOutcome::Waiting { .. })));

    // "stop" resolves as a system command even while waiting.
    w.engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "stop"))
        .await
        .unwrap();

    let conversation = w
        .store
        .get_conversation(first.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.status, ConversationStatus::Active);
    assert!(conversation.active_automation.is_none());
    assert!(conversation.collected_data.get("_waiting_node_id").is_none());
}

#[tokio::test]
async fn menu_command_lists_automations_as_buttons() {
    let w = world().await;
    w.store
        .create_automation(&greeting_flow(w.account.id))
        .await
        .unwrap();
    w.store
        .create_automation(&collect_flow(w.account.id))
        .await
        .unwrap();

    w.engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "menu"))
        .await
        .unwrap();

    let sent = w.gateway.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        OutboundMessage::QuickReplies { replies, .. } => {
            assert_eq!(replies.len(), 2);
            assert!(replies[0].payload.starts_with("AUTOMATION:"));
        }
        other => panic!("expected quick replies, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn long_delay_schedules_and_resume_loop_continues() {
    let mut w = world().await;
    let automation = flow_automation(
        w.account.id,
        "drip",
        FlowDefinition {
            nodes: vec![
                node("t", "trigger_keyword_dm", json!({"keywords": ["obuna"]})),
                node("a", "action_send_dm", json!({"message": "Xush kelibsiz!"})),
                node("d", "action_delay", json!({"delay_type": "minutes", "delay_value": 30})),
                node("b", "action_send_dm", json!({"message": "Eslatma: kurs ertaga!"})),
            ],
            edges: vec![edge("t", "a"), edge("a", "d"), edge("d", "b")],
        },
    );
    w.store.create_automation(&automation).await.unwrap();
    let resume_rx = w.resume_rx.take().unwrap();
    let _loop_handle = w.engine.spawn_resume_loop(resume_rx);

    let report = w
        .engine
        .process_event(&w.account, &InboundEvent::message("psid-1", "obuna"))
        .await
        .unwrap();
    assert!(matches!(report.outcome, Some(RunOutcome::Scheduled { .. })));
    assert_eq!(w.gateway.sent_texts(), vec!["Xush kelibsiz!"]);

    // Let the 30 minute timer elapse and the resume loop drain it.
    tokio::time::sleep(std::time::Duration::from_secs(31 * 60)).await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        w.gateway.sent_texts(),
        vec!["Xush kelibsiz!", "Eslatma: kurs ertaga!"]
    );
    let conversation = w
        .store
        .get_conversation(report.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert!(conversation.active_automation.is_none());
}

#[tokio::test]
async fn flat_trigger_automation_runs_steps() {
    let w = world().await;
    let automation = Automation {
        id: Uuid::new_v4(),
        account_id: w.account.id,
        name: "promo".into(),
        status: AutomationStatus::Active,
        triggers: vec![TriggerDef {
            trigger_type: TriggerType::KeywordDm,
            keywords: vec!["aksiya".into()],
            case_sensitive: false,
            exact_match: false,
        }],
        actions: vec![convoflow::model::ActionStep {
            order: 0,
            action_type: "send_message".into(),
            message_template: Some("Aksiya 50%!".into()),
            buttons: Vec::new(),
            delay_seconds: None,
            webhook_url: None,
            settings: serde_json::Map::new(),
        }],
        flow: None,
        trigger_count: 0,
        conversion_count: 0,
    };
    w.store.create_automation(&automation).await.unwrap();

    let report = w
        .engine
        .process_event(
            &w.account,
            &InboundEvent::message("psid-1", "aksiya bormi?"),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, Some(RunOutcome::Completed { messages_sent: 1 }));
    assert_eq!(w.gateway.sent_texts(), vec!["Aksiya 50%!"]);
}
