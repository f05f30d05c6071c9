//! Validated flow graphs.
//!
//! Authored flows arrive as string-tagged nodes with free-form data maps
//! (`model::FlowDefinition`). `FlowGraph::load` turns that into a closed
//! `NodeKind` enum with per-type config structs, checks every edge endpoint
//! exists, and builds the adjacency list once so execution never parses.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::FlowError;
use crate::model::{FlowDefinition, FlowNodeDef};

/// Keyword config on a trigger node. A list of exactly `__all__`, `+`, `*`,
/// or an empty list means "match every message".
#[derive(Debug, Clone, Default)]
pub struct TriggerKeywords {
    pub keywords: Vec<String>,
}

impl TriggerKeywords {
    /// Parse from the authored value: array of strings or a comma/space
    /// separated string.
    pub fn parse(value: Option<&Value>) -> Self {
        let keywords = match value {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split([' ', ','])
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            _ => Vec::new(),
        };
        Self { keywords }
    }

    /// Whether this trigger matches every message.
    pub fn matches_all(&self) -> bool {
        self.keywords.is_empty()
            || (self.keywords.len() == 1
                && matches!(self.keywords[0].as_str(), "__all__" | "+" | "*"))
    }

    /// Match `text` against the keyword list.
    ///
    /// Returns the matched keyword and whether the match was exact (the whole
    /// message equals the keyword) or a substring hit.
    pub fn match_text(&self, text: &str) -> Option<(&str, bool)> {
        let lowered = text.to_lowercase();
        let trimmed = lowered.trim();
        // Exact match beats substring match across the keyword list.
        if let Some(kw) = self.keywords.iter().find(|kw| trimmed == kw.as_str()) {
            return Some((kw, true));
        }
        self.keywords
            .iter()
            .find(|kw| lowered.contains(kw.as_str()))
            .map(|kw| (kw.as_str(), false))
    }
}

/// Config for `action_send_buttons`.
#[derive(Debug, Clone, Deserialize)]
pub struct ButtonsConfig {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub buttons: Vec<ButtonDef>,
}

/// One authored button: a bare string, or a title/payload pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ButtonDef {
    Title(String),
    Full {
        title: String,
        #[serde(default)]
        payload: Option<String>,
    },
}

impl ButtonDef {
    pub fn title(&self) -> &str {
        match self {
            ButtonDef::Title(t) => t,
            ButtonDef::Full { title, .. } => title,
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            ButtonDef::Title(t) => t,
            ButtonDef::Full { title, payload } => payload.as_deref().unwrap_or(title),
        }
    }
}

/// Config for `action_delay`.
#[derive(Debug, Clone, Deserialize)]
pub struct DelayConfig {
    #[serde(default = "default_delay_type")]
    pub delay_type: String,
    #[serde(default, alias = "seconds")]
    pub delay_value: u64,
}

fn default_delay_type() -> String {
    "seconds".to_string()
}

impl DelayConfig {
    pub fn duration(&self) -> Duration {
        let secs = match self.delay_type.as_str() {
            "minutes" => self.delay_value * 60,
            "hours" => self.delay_value * 3600,
            _ => self.delay_value,
        };
        Duration::from_secs(secs)
    }
}

/// Config for `action_collect_data`.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectDataConfig {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub field_name: Option<String>,
}

impl CollectDataConfig {
    /// Field name under which the reply is stored; falls back to a
    /// node-derived name when the author left it blank.
    pub fn field_for(&self, node_id: &str) -> String {
        self.field_name
            .clone()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| format!("response_{node_id}"))
    }
}

/// Config for `action_send_media`.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub media_url: String,
    #[serde(default)]
    pub caption: String,
}

/// Config for `action_send_link`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub message: String,
}

/// Typed flow node kinds. Adding a kind is a compile-time-checked change
/// everywhere the interpreter dispatches.
#[derive(Debug, Clone)]
pub enum NodeKind {
    // Triggers: flow entry points, no side effect of their own.
    TriggerKeywordDm(TriggerKeywords),
    TriggerKeywordComment(TriggerKeywords),
    TriggerStoryMention,
    TriggerStoryReply,
    TriggerNewFollower,
    TriggerStart,

    // Actions.
    SendDm { message: String },
    SendButtons(ButtonsConfig),
    SendMedia(MediaConfig),
    SendLink(LinkConfig),
    Delay(DelayConfig),
    AddTag { tag: String },
    RemoveTag { tag: String },
    CollectData(CollectDataConfig),
    HumanHandoff { message: String },
    Webhook { url: String },

    // Conditions: produce a branch label that selects outgoing edges.
    ConditionHasTag { tag: String },
    ConditionIsFollower,
    ConditionCustom { rules: serde_json::Map<String, Value> },
}

impl NodeKind {
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            NodeKind::TriggerKeywordDm(_)
                | NodeKind::TriggerKeywordComment(_)
                | NodeKind::TriggerStoryMention
                | NodeKind::TriggerStoryReply
                | NodeKind::TriggerNewFollower
                | NodeKind::TriggerStart
        )
    }
}

/// A validated node.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
}

/// One outgoing edge, with an optional branch label.
#[derive(Debug, Clone)]
pub struct OutEdge {
    pub target: String,
    pub branch: Option<String>,
}

/// A validated, execution-ready flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: HashMap<String, FlowNode>,
    adjacency: HashMap<String, Vec<OutEdge>>,
    entry: String,
}

impl FlowGraph {
    /// Validate an authored definition into an executable graph.
    ///
    /// Fails fast on empty flows, missing trigger nodes, unknown node types,
    /// malformed node data, and dangling edge endpoints, so definition
    /// problems surface at load time, not mid-conversation.
    pub fn load(def: &FlowDefinition) -> Result<Self, FlowError> {
        if def.nodes.is_empty() {
            return Err(FlowError::EmptyFlow);
        }

        let mut nodes = HashMap::with_capacity(def.nodes.len());
        let mut entry = None;
        for node_def in &def.nodes {
            let kind = parse_node_kind(node_def)?;
            if kind.is_trigger() && entry.is_none() {
                entry = Some(node_def.node_id.clone());
            }
            nodes.insert(
                node_def.node_id.clone(),
                FlowNode {
                    id: node_def.node_id.clone(),
                    kind,
                },
            );
        }

        let entry = entry.ok_or(FlowError::MissingTrigger)?;

        let mut adjacency: HashMap<String, Vec<OutEdge>> = HashMap::new();
        for edge in &def.edges {
            if !nodes.contains_key(&edge.source_node_id) {
                return Err(FlowError::MissingNode {
                    node_id: edge.source_node_id.clone(),
                });
            }
            if !nodes.contains_key(&edge.target_node_id) {
                return Err(FlowError::MissingNode {
                    node_id: edge.target_node_id.clone(),
                });
            }
            adjacency
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(OutEdge {
                    target: edge.target_node_id.clone(),
                    branch: edge.source_handle.clone(),
                });
        }

        Ok(Self {
            nodes,
            adjacency,
            entry,
        })
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    /// The flow's entry node (first trigger in authoring order).
    pub fn entry_node(&self) -> &FlowNode {
        &self.nodes[&self.entry]
    }

    /// Outgoing edges of a node, in authoring order.
    pub fn out_edges(&self, id: &str) -> &[OutEdge] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The keyword trigger config of the entry node, when it has one.
    pub fn trigger_keywords(&self) -> Option<&TriggerKeywords> {
        match &self.entry_node().kind {
            NodeKind::TriggerKeywordDm(kw) | NodeKind::TriggerKeywordComment(kw) => Some(kw),
            _ => None,
        }
    }
}

fn parse_node_kind(def: &FlowNodeDef) -> Result<NodeKind, FlowError> {
    let data = Value::Object(def.data.clone());
    let invalid = |message: String| FlowError::InvalidNodeData {
        node_id: def.node_id.clone(),
        node_type: def.node_type.clone(),
        message,
    };

    let kind = match def.node_type.as_str() {
        "trigger_keyword_dm" => {
            NodeKind::TriggerKeywordDm(TriggerKeywords::parse(def.data.get("keywords")))
        }
        "trigger_keyword_comment" => {
            NodeKind::TriggerKeywordComment(TriggerKeywords::parse(def.data.get("keywords")))
        }
        "trigger_story_mention" => NodeKind::TriggerStoryMention,
        "trigger_story_reply" => NodeKind::TriggerStoryReply,
        "trigger_new_follower" => NodeKind::TriggerNewFollower,
        "trigger_start" => NodeKind::TriggerStart,

        "action_send_dm" => NodeKind::SendDm {
            message: str_field(&def.data, "message"),
        },
        "action_send_buttons" | "action_send_dm_with_buttons" => NodeKind::SendButtons(
            serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?,
        ),
        "action_send_media" => NodeKind::SendMedia(
            serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?,
        ),
        "action_send_link" => NodeKind::SendLink(
            serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?,
        ),
        "action_delay" => NodeKind::Delay(
            serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?,
        ),
        "action_add_tag" => NodeKind::AddTag {
            tag: require_str_field(&def.data, "tag").map_err(invalid)?,
        },
        "action_remove_tag" => NodeKind::RemoveTag {
            tag: require_str_field(&def.data, "tag").map_err(invalid)?,
        },
        "action_collect_data" => NodeKind::CollectData(
            serde_json::from_value(data).map_err(|e| invalid(e.to_string()))?,
        ),
        "action_human_handoff" => NodeKind::HumanHandoff {
            message: str_field(&def.data, "message"),
        },
        "action_webhook" => NodeKind::Webhook {
            url: require_str_field(&def.data, "webhook_url").map_err(invalid)?,
        },

        "condition_has_tag" => NodeKind::ConditionHasTag {
            tag: require_str_field(&def.data, "tag").map_err(invalid)?,
        },
        "condition_is_follower" => NodeKind::ConditionIsFollower,
        "condition_custom" => NodeKind::ConditionCustom {
            rules: def.data.clone(),
        },

        other => return Err(invalid(format!("unknown node type {other}"))),
    };

    Ok(kind)
}

fn str_field(data: &serde_json::Map<String, Value>, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn require_str_field(
    data: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| format!("missing required field `{key}`"))
}
