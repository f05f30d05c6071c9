//! Core domain types: conversations, automations, messages, inbound events.

pub mod automation;
pub mod conversation;
pub mod event;
pub mod message;

pub use automation::{
    ActionStep, Automation, AutomationStatus, FlowDefinition, FlowEdgeDef, FlowNodeDef,
    TriggerDef, TriggerType,
};
pub use conversation::{
    Account, Conversation, ConversationStatus, LAST_QUESTION_KEY, WAITING_NODE_KEY,
};
pub use event::InboundEvent;
pub use message::{DeliveryStatus, Direction, Message, MessageKind};
