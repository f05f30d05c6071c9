//! ConvoFlow: conversational automation engine for Instagram-style DMs.

pub mod config;
pub mod crm;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod flow;
pub mod intent;
pub mod model;
pub mod store;
pub mod webhook;

pub use engine::{ChatEngine, EventReport};
pub use error::{Error, Result};
