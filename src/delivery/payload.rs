//! Outbound message shapes and platform payload limits.

use serde::Serialize;

/// Hard platform cap on quick replies per message. Extras are dropped, not
/// split into a second message.
pub const MAX_QUICK_REPLIES: usize = 13;
/// Platform cap on quick-reply and button titles.
pub const MAX_TITLE_CHARS: usize = 20;
/// Button template cap. Messages above it still go out as quick replies;
/// the count is only logged for flow authors to notice.
pub const MAX_TEMPLATE_BUTTONS: usize = 2;

/// One quick-reply option attached to a text message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuickReply {
    pub title: String,
    pub payload: String,
}

/// What the engine asks the gateway to send.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Text {
        text: String,
    },
    QuickReplies {
        text: String,
        replies: Vec<QuickReply>,
    },
    Media {
        url: String,
        caption: String,
    },
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundMessage::Text { text: text.into() }
    }

    /// Human-readable content for the message log.
    pub fn log_content(&self) -> String {
        match self {
            OutboundMessage::Text { text } => text.clone(),
            OutboundMessage::QuickReplies { text, .. } => text.clone(),
            OutboundMessage::Media { url, caption } if caption.is_empty() => url.clone(),
            OutboundMessage::Media { url, caption } => format!("{caption} {url}"),
        }
    }
}

/// Truncate a title to the platform limit, marking the cut with an ellipsis.
pub fn clamp_title(title: &str) -> String {
    let chars: Vec<char> = title.chars().collect();
    if chars.len() <= MAX_TITLE_CHARS {
        return title.to_string();
    }
    let mut out: String = chars[..MAX_TITLE_CHARS - 1].iter().collect();
    out.push('…');
    out
}

/// Normalize authored options into platform-legal quick replies: truncated
/// titles, at most [`MAX_QUICK_REPLIES`] entries.
pub fn format_quick_replies(
    options: impl IntoIterator<Item = (String, String)>,
) -> Vec<QuickReply> {
    options
        .into_iter()
        .take(MAX_QUICK_REPLIES)
        .map(|(title, payload)| QuickReply {
            title: clamp_title(&title),
            payload,
        })
        .collect()
}

/// Enumerated text rendering of a button message, logged when the option
/// count exceeds what a button template allows.
pub fn text_alternative(text: &str, options: &[QuickReply]) -> String {
    let mut out = String::from(text);
    for (i, opt) in options.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, opt.title));
    }
    out
}
