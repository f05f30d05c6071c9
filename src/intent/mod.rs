//! Intent resolution: an ordered matcher cascade over incoming messages.

pub mod resolver;
pub mod types;

pub use resolver::{IntentMatcher, IntentResolver, ResolveContext};
pub use types::{Intent, IntentKind, SystemCommand};
