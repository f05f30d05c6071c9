//! Variable substitution for outgoing message templates.
//!
//! Placeholders use single braces: `{name}`, `{username}`, `{keyword}`, plus
//! any collected-data field whose key does not start with an underscore.
//! Unresolved placeholders stay verbatim so an authoring typo is visible in
//! the sent message instead of silently vanishing.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::model::Conversation;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// The substitution context for one interpreter step.
pub struct TemplateContext<'a> {
    conversation: &'a Conversation,
    /// The keyword that triggered the current run, if any.
    keyword: Option<&'a str>,
    /// The raw text of the message being processed.
    text: &'a str,
}

impl<'a> TemplateContext<'a> {
    pub fn new(conversation: &'a Conversation, keyword: Option<&'a str>, text: &'a str) -> Self {
        Self {
            conversation,
            keyword,
            text,
        }
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "name" | "first_name" => Some(self.conversation.display_name().to_string()),
            "full_name" => self
                .conversation
                .participant_name
                .clone()
                .or_else(|| self.conversation.participant_username.clone()),
            "username" => self.conversation.participant_username.clone(),
            "keyword" => self.keyword.map(String::from),
            "text" | "message" => Some(self.text.to_string()),
            _ if name.starts_with('_') => None,
            _ => self
                .conversation
                .collected_data
                .get(name)
                .map(value_to_string),
        }
    }

    /// Substitute all resolvable placeholders in `template`.
    pub fn render(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &regex::Captures<'_>| {
                self.resolve(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
