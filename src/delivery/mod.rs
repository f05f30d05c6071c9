//! Outbound delivery: message shapes, the gateway seam, and the Graph API
//! client behind it.

pub mod gateway;
pub mod graph_api;
pub mod payload;

pub use gateway::{DeliveryGateway, DeliveryReceipt, ParticipantProfile};
pub use graph_api::GraphApiGateway;
pub use payload::{
    MAX_QUICK_REPLIES, MAX_TEMPLATE_BUTTONS, MAX_TITLE_CHARS, OutboundMessage, QuickReply,
    format_quick_replies,
};
