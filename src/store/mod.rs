//! Conversation state persistence.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{ConversationStore, ProfileUpdate};
