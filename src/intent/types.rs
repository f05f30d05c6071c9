//! Resolved intent types.

use uuid::Uuid;

/// System commands the resolver recognizes ahead of any automation keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    StartFlow,
    StopFlow,
    HumanHandoff,
    MainMenu,
    GoBack,
}

impl SystemCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemCommand::StartFlow => "start_flow",
            SystemCommand::StopFlow => "stop_flow",
            SystemCommand::HumanHandoff => "human_handoff",
            SystemCommand::MainMenu => "main_menu",
            SystemCommand::GoBack => "go_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "start_flow" => SystemCommand::StartFlow,
            "stop_flow" => SystemCommand::StopFlow,
            "human_handoff" => SystemCommand::HumanHandoff,
            "main_menu" => SystemCommand::MainMenu,
            "go_back" => SystemCommand::GoBack,
            _ => return None,
        })
    }
}

/// What the resolver decided a message means.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentKind {
    /// Structured payload asking to jump to a node in the active flow.
    FlowNavigation { node_id: String },
    /// Structured payload asking to start a specific automation.
    StartAutomation { automation_id: Uuid },
    /// Structured payload carrying a named custom action.
    CustomAction { action: String },
    /// An unstructured button payload, handled as high-confidence input.
    Payload { payload: String },
    /// A recognized system command word.
    SystemCommand {
        command: SystemCommand,
        /// Text following the command word, if any.
        additional_text: Option<String>,
    },
    /// Complaint or issue report, sub-categorized.
    Complaint { category: String },
    /// Free-form reply while the conversation is waiting on a flow node.
    UserInput,
    /// Answer to a pending collect-data question.
    CollectedResponse { field: String },
    /// Message matched an automation's trigger keywords.
    TriggerMatch {
        automation_id: Uuid,
        keyword: Option<String>,
    },
    /// Matched a general category (greeting, price inquiry, ...).
    General { category: String },
    /// Nothing matched.
    Unknown,
}

/// A resolved intent with its confidence and origin.
#[derive(Debug, Clone)]
pub struct Intent {
    pub kind: IntentKind,
    /// In `[0.0, 1.0]`. Exact matches report 1.0, substring and heuristic
    /// matches proportionally less.
    pub confidence: f32,
    /// Whether this intent should route the conversation to a person.
    pub requires_handoff: bool,
    /// Name of the matcher that produced this intent.
    pub matched_by: &'static str,
}

impl Intent {
    pub fn new(kind: IntentKind, confidence: f32, matched_by: &'static str) -> Self {
        Self {
            kind,
            confidence,
            requires_handoff: false,
            matched_by,
        }
    }

    pub fn with_handoff(mut self) -> Self {
        self.requires_handoff = true;
        self
    }

    pub fn unknown() -> Self {
        Intent::new(IntentKind::Unknown, 0.0, "unknown")
    }
}
