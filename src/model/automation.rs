//! Operator-authored automation definitions.
//!
//! Automations are authored externally and read-only to the engine. An
//! automation is either a flat ordered action list or a flow graph; the raw
//! graph (`FlowDefinition`) is validated into a typed `flow::FlowGraph`
//! before execution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Automation lifecycle status. Only `Active` automations can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Draft,
    Active,
    Paused,
}

impl AutomationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationStatus::Draft => "draft",
            AutomationStatus::Active => "active",
            AutomationStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => AutomationStatus::Active,
            "paused" => AutomationStatus::Paused,
            _ => AutomationStatus::Draft,
        }
    }
}

/// What kind of inbound event a trigger listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    KeywordDm,
    KeywordComment,
    StoryMention,
    StoryReply,
    NewFollower,
}

/// A trigger definition on a flat (non-flow) automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    pub trigger_type: TriggerType,
    pub keywords: Vec<String>,
    pub case_sensitive: bool,
    pub exact_match: bool,
}

impl TriggerDef {
    /// Return the keyword matching `text`, if any.
    ///
    /// Exact-match mode requires full string equality; substring mode matches
    /// anywhere in the text. Comparison is case-insensitive unless
    /// `case_sensitive` is set.
    pub fn matching_keyword(&self, text: &str) -> Option<&str> {
        let haystack = if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };
        self.keywords.iter().map(String::as_str).find(|kw| {
            let needle = if self.case_sensitive {
                kw.to_string()
            } else {
                kw.to_lowercase()
            };
            if self.exact_match {
                haystack.trim() == needle
            } else {
                haystack.contains(&needle)
            }
        })
    }
}

/// One step in a flat action-list automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub order: u32,
    pub action_type: String,
    pub message_template: Option<String>,
    pub buttons: Vec<String>,
    pub delay_seconds: Option<u64>,
    pub webhook_url: Option<String>,
    /// Free-form per-action settings (e.g. `{"tag": "vip"}`).
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// Raw flow node as authored: a string type tag plus a free-form data map.
/// Validated into `flow::NodeKind` at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNodeDef {
    pub node_id: String,
    pub node_type: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Raw flow edge as authored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdgeDef {
    pub source_node_id: String,
    pub target_node_id: String,
    /// Branch label, meaningful only when the source is a condition node.
    #[serde(default)]
    pub source_handle: Option<String>,
}

/// The authored flow graph: nodes plus directed edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub nodes: Vec<FlowNodeDef>,
    pub edges: Vec<FlowEdgeDef>,
}

/// An operator-authored automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub status: AutomationStatus,
    pub triggers: Vec<TriggerDef>,
    /// Flat ordered actions; empty when the automation is flow-based.
    pub actions: Vec<ActionStep>,
    /// Flow graph; `None` for flat action-list automations.
    pub flow: Option<FlowDefinition>,
    pub trigger_count: u64,
    pub conversion_count: u64,
}

impl Automation {
    pub fn is_flow_based(&self) -> bool {
        self.flow.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.status == AutomationStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(keywords: &[&str], exact: bool, case_sensitive: bool) -> TriggerDef {
        TriggerDef {
            trigger_type: TriggerType::KeywordDm,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            case_sensitive,
            exact_match: exact,
        }
    }

    #[test]
    fn substring_trigger_matches_inside_text() {
        let t = trigger(&["narx"], false, false);
        assert_eq!(t.matching_keyword("Narxi qancha?"), Some("narx"));
        assert_eq!(t.matching_keyword("salom"), None);
    }

    #[test]
    fn exact_trigger_requires_equality() {
        let t = trigger(&["start"], true, false);
        assert_eq!(t.matching_keyword("START"), Some("start"));
        assert_eq!(t.matching_keyword("start course"), None);
    }

    #[test]
    fn case_sensitive_trigger() {
        let t = trigger(&["VIP"], false, true);
        assert_eq!(t.matching_keyword("give me VIP access"), Some("VIP"));
        assert_eq!(t.matching_keyword("give me vip access"), None);
    }

    #[test]
    fn exact_trigger_trims_whitespace() {
        let t = trigger(&["stop"], true, false);
        assert_eq!(t.matching_keyword("  stop "), Some("stop"));
    }
}
