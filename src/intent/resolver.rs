//! The intent resolution cascade.
//!
//! An explicit, ordered pipeline of matchers. Each matcher either claims the
//! message (returning an [`Intent`]) or passes. The first claim wins, so
//! ordering is the priority policy: structured payloads beat system commands,
//! system commands beat complaints, and so on down to general categories and
//! the unknown fallback.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::config::IntentPatterns;
use crate::flow::FlowGraph;
use crate::model::{Automation, Conversation, TriggerType};

use super::types::{Intent, IntentKind, SystemCommand};

/// Everything a matcher may look at for one message.
pub struct ResolveContext<'a> {
    pub conversation: &'a Conversation,
    /// Active automations for the conversation's account, with their
    /// pre-validated flow graphs where flow-based.
    pub automations: &'a [(Automation, Option<FlowGraph>)],
    /// Message text, may be empty for pure payload taps.
    pub text: &'a str,
    /// Structured button/quick-reply payload, if the event carried one.
    pub payload: Option<&'a str>,
}

pub trait IntentMatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent>;
}

/// The ordered pipeline.
pub struct IntentResolver {
    matchers: Vec<Box<dyn IntentMatcher>>,
}

impl IntentResolver {
    pub fn new(patterns: IntentPatterns) -> Self {
        let patterns = Arc::new(patterns);
        let matchers: Vec<Box<dyn IntentMatcher>> = vec![
            Box::new(PayloadMatcher),
            Box::new(SystemCommandMatcher {
                patterns: patterns.clone(),
            }),
            Box::new(ComplaintMatcher {
                patterns: patterns.clone(),
            }),
            Box::new(ContextualMatcher),
            Box::new(KeywordTriggerMatcher),
            Box::new(FlowTriggerMatcher),
            Box::new(GeneralMatcher { patterns }),
        ];
        Self { matchers }
    }

    /// Run the cascade. Always produces an intent; the fallback is
    /// [`IntentKind::Unknown`] at confidence 0.0.
    pub fn resolve(&self, ctx: &ResolveContext<'_>) -> Intent {
        for matcher in &self.matchers {
            if let Some(intent) = matcher.resolve(ctx) {
                debug!(
                    matcher = matcher.name(),
                    kind = ?intent.kind,
                    confidence = intent.confidence,
                    "intent resolved"
                );
                return intent;
            }
        }
        Intent::unknown()
    }
}

// ── 1. Structured payloads ──────────────────────────────────────────

struct PayloadMatcher;

impl IntentMatcher for PayloadMatcher {
    fn name(&self) -> &'static str {
        "payload"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent> {
        let payload = ctx.payload?.trim();
        if payload.is_empty() {
            return None;
        }

        if let Some((action, data)) = payload.split_once(':') {
            let data = data.trim();
            match action.to_uppercase().as_str() {
                "FLOW" | "NODE" if !data.is_empty() => {
                    return Some(Intent::new(
                        IntentKind::FlowNavigation {
                            node_id: data.to_string(),
                        },
                        1.0,
                        self.name(),
                    ));
                }
                "AUTOMATION" | "START" => {
                    // Only honor references to this account's own active
                    // automations; a stale or foreign id falls through to
                    // the generic payload intent.
                    if let Ok(id) = Uuid::parse_str(data) {
                        if ctx.automations.iter().any(|(a, _)| a.id == id) {
                            return Some(Intent::new(
                                IntentKind::StartAutomation { automation_id: id },
                                1.0,
                                self.name(),
                            ));
                        }
                    }
                }
                "ACTION" if !data.is_empty() => {
                    return Some(Intent::new(
                        IntentKind::CustomAction {
                            action: data.to_string(),
                        },
                        1.0,
                        self.name(),
                    ));
                }
                _ => {}
            }
        }

        Some(Intent::new(
            IntentKind::Payload {
                payload: payload.to_string(),
            },
            0.9,
            self.name(),
        ))
    }
}

// ── 2. System commands ──────────────────────────────────────────────

struct SystemCommandMatcher {
    patterns: Arc<IntentPatterns>,
}

impl IntentMatcher for SystemCommandMatcher {
    fn name(&self) -> &'static str {
        "system_command"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent> {
        let text = ctx.text.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }

        for (command_key, words) in &self.patterns.system_commands {
            let Some(command) = SystemCommand::parse(command_key) else {
                continue;
            };
            for word in words {
                let word = word.to_lowercase();
                if text == word {
                    return Some(Intent::new(
                        IntentKind::SystemCommand {
                            command,
                            additional_text: None,
                        },
                        1.0,
                        self.name(),
                    ));
                }
                // Command word followed by more text, e.g. "operator please".
                if let Some(rest) = text.strip_prefix(&format!("{word} ")) {
                    return Some(Intent::new(
                        IntentKind::SystemCommand {
                            command,
                            additional_text: Some(rest.trim().to_string()),
                        },
                        0.9,
                        self.name(),
                    ));
                }
            }
        }

        // Operator-request keywords count anywhere in the message, e.g.
        // "menejer bilan bog'lang".
        for word in &self.patterns.handoff_keywords {
            if text.contains(&word.to_lowercase()) {
                return Some(Intent::new(
                    IntentKind::SystemCommand {
                        command: SystemCommand::HumanHandoff,
                        additional_text: None,
                    },
                    0.85,
                    self.name(),
                ));
            }
        }
        None
    }
}

// ── 3. Complaints ───────────────────────────────────────────────────

/// Sub-category priority when a complaint matches several word lists.
const COMPLAINT_PRIORITY: [&str; 7] = [
    "complaint",
    "issue",
    "refund",
    "defect",
    "delay",
    "fraud",
    "dissatisfaction",
];

struct ComplaintMatcher {
    patterns: Arc<IntentPatterns>,
}

impl IntentMatcher for ComplaintMatcher {
    fn name(&self) -> &'static str {
        "complaint"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent> {
        let text = ctx.text.to_lowercase();
        if text.is_empty() {
            return None;
        }

        let hit = self
            .patterns
            .complaint_patterns
            .iter()
            .any(|p| text.contains(&p.to_lowercase()));
        if !hit {
            return None;
        }

        let category = COMPLAINT_PRIORITY
            .iter()
            .find(|cat| {
                self.patterns
                    .complaint_categories
                    .get(**cat)
                    .is_some_and(|words| words.iter().any(|w| text.contains(&w.to_lowercase())))
            })
            .copied()
            .unwrap_or("complaint");

        Some(
            Intent::new(
                IntentKind::Complaint {
                    category: category.to_string(),
                },
                0.85,
                self.name(),
            )
            .with_handoff(),
        )
    }
}

// ── 4. Conversation context ─────────────────────────────────────────

struct ContextualMatcher;

impl IntentMatcher for ContextualMatcher {
    fn name(&self) -> &'static str {
        "contextual"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent> {
        if ctx.conversation.active_automation.is_none() {
            return None;
        }
        if ctx.conversation.is_waiting() {
            return Some(Intent::new(IntentKind::UserInput, 0.95, self.name()));
        }
        if let Some(field) = ctx.conversation.pending_question() {
            return Some(Intent::new(
                IntentKind::CollectedResponse {
                    field: field.to_string(),
                },
                0.9,
                self.name(),
            ));
        }
        None
    }
}

// ── 5. Flat automation keyword triggers ─────────────────────────────

struct KeywordTriggerMatcher;

impl IntentMatcher for KeywordTriggerMatcher {
    fn name(&self) -> &'static str {
        "keyword_trigger"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent> {
        let text = ctx.text.trim();
        if text.is_empty() {
            return None;
        }

        for (automation, _) in ctx.automations {
            for trigger in &automation.triggers {
                // Only DM keyword triggers fire from a DM; comment and story
                // triggers listen to other event sources.
                if trigger.trigger_type != TriggerType::KeywordDm {
                    continue;
                }
                let Some(keyword) = trigger.matching_keyword(text) else {
                    continue;
                };
                let exact = text.eq_ignore_ascii_case(keyword)
                    || text.to_lowercase() == keyword.to_lowercase();
                let confidence = if exact {
                    1.0
                } else {
                    // Longer keywords in shorter messages are stronger signals.
                    (keyword.chars().count() as f32 / text.chars().count() as f32)
                        .clamp(0.6, 0.95)
                };
                return Some(Intent::new(
                    IntentKind::TriggerMatch {
                        automation_id: automation.id,
                        keyword: Some(keyword.to_string()),
                    },
                    confidence,
                    self.name(),
                ));
            }
        }
        None
    }
}

// ── 6. Flow-graph keyword triggers ──────────────────────────────────

struct FlowTriggerMatcher;

impl IntentMatcher for FlowTriggerMatcher {
    fn name(&self) -> &'static str {
        "flow_trigger"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent> {
        let text = ctx.text.trim();
        if text.is_empty() {
            return None;
        }

        // Exact keyword match beats substring beats match-all, across all
        // candidate flows.
        let mut best: Option<(Intent, f32)> = None;
        for (automation, graph) in ctx.automations {
            let Some(keywords) = graph.as_ref().and_then(FlowGraph::trigger_keywords) else {
                continue;
            };

            let candidate = if keywords.matches_all() {
                Some((None, 0.5))
            } else {
                keywords.match_text(text).map(|(kw, exact)| {
                    (Some(kw.to_string()), if exact { 1.0 } else { 0.8 })
                })
            };

            if let Some((keyword, confidence)) = candidate {
                if best.as_ref().is_none_or(|(_, c)| confidence > *c) {
                    best = Some((
                        Intent::new(
                            IntentKind::TriggerMatch {
                                automation_id: automation.id,
                                keyword,
                            },
                            confidence,
                            self.name(),
                        ),
                        confidence,
                    ));
                }
            }
        }
        best.map(|(intent, _)| intent)
    }
}

// ── 7. General categories ───────────────────────────────────────────

/// Match order for general categories.
const GENERAL_PRIORITY: [&str; 6] = [
    "price_inquiry",
    "order_intent",
    "info_request",
    "delivery_status",
    "greeting",
    "thanks",
];

struct GeneralMatcher {
    patterns: Arc<IntentPatterns>,
}

impl IntentMatcher for GeneralMatcher {
    fn name(&self) -> &'static str {
        "general"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<Intent> {
        let text = ctx.text.to_lowercase();
        if text.is_empty() {
            return None;
        }

        for category in GENERAL_PRIORITY {
            let Some(cat) = self.patterns.general_categories.get(category) else {
                continue;
            };
            if cat.patterns.iter().any(|p| text.contains(&p.to_lowercase())) {
                return Some(Intent::new(
                    IntentKind::General {
                        category: category.to_string(),
                    },
                    cat.confidence,
                    self.name(),
                ));
            }
        }
        None
    }
}
