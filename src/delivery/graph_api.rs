//! Graph API delivery client.
//!
//! Sends DMs, quick replies, and media on behalf of connected accounts, and
//! classifies the platform's error responses into the retry categories the
//! engine acts on.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::DeliveryError;
use crate::model::Account;

use super::gateway::{DeliveryGateway, DeliveryReceipt, ParticipantProfile};
use super::payload::{MAX_TEMPLATE_BUTTONS, OutboundMessage, text_alternative};

/// Graph API error code for a message sent outside the engagement window.
const ERROR_CODE_WINDOW: i64 = 10;
/// Graph API error codes signalling rate limiting.
const RATE_LIMIT_CODES: [i64; 3] = [4, 17, 613];

pub struct GraphApiGateway {
    base_url: String,
    client: reqwest::Client,
    rate_limit_backoff: Duration,
    /// Page access tokens keyed by connected account id.
    tokens: HashMap<Uuid, SecretString>,
}

impl GraphApiGateway {
    pub fn new(config: &EngineConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.graph_api_url.trim_end_matches('/').to_string(),
            client,
            rate_limit_backoff: config.rate_limit_backoff,
            tokens: HashMap::new(),
        }
    }

    pub fn with_token(mut self, account_id: Uuid, token: SecretString) -> Self {
        self.tokens.insert(account_id, token);
        self
    }

    pub fn set_token(&mut self, account_id: Uuid, token: SecretString) {
        self.tokens.insert(account_id, token);
    }

    fn token_for(&self, account: &Account) -> Result<&SecretString, DeliveryError> {
        self.tokens
            .get(&account.id)
            .ok_or(DeliveryError::CredentialMissing {
                account_id: account.id,
            })
    }

    fn messages_url(&self) -> String {
        format!("{}/me/messages", self.base_url)
    }

    fn message_body(&self, recipient_id: &str, message: &OutboundMessage) -> Value {
        let payload = match message {
            OutboundMessage::Text { text } => json!({ "text": text }),
            OutboundMessage::QuickReplies { text, replies } => {
                if replies.len() > MAX_TEMPLATE_BUTTONS {
                    // Logged for diagnostics; the message still goes out as
                    // quick replies, which carry up to thirteen options.
                    tracing::debug!(
                        options = replies.len(),
                        alternative = %text_alternative(text, replies),
                        "option count exceeds the button template cap"
                    );
                }
                json!({
                    "text": text,
                    "quick_replies": replies.iter().map(|r| json!({
                        "content_type": "text",
                        "title": r.title,
                        "payload": r.payload,
                    })).collect::<Vec<_>>(),
                })
            }
            OutboundMessage::Media { url, .. } => json!({
                "attachment": {
                    "type": media_type_for(url),
                    "payload": { "url": url, "is_reusable": true },
                }
            }),
        };

        json!({
            "recipient": { "id": recipient_id },
            "message": payload,
        })
    }

    fn classify(&self, code: Option<i64>, message: &str) -> DeliveryError {
        let lowered = message.to_lowercase();
        if code == Some(ERROR_CODE_WINDOW)
            || lowered.contains("outside of allowed window")
            || lowered.contains("24 hour")
        {
            return DeliveryError::ExpiredWindow {
                recipient: String::new(),
                message: message.to_string(),
            };
        }
        if code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) {
            return DeliveryError::RateLimited {
                retry_after: self.rate_limit_backoff,
            };
        }
        DeliveryError::Transport {
            code,
            message: message.to_string(),
        }
    }

    fn parse_error(&self, recipient_id: &str, body: Value) -> DeliveryError {
        let err = body.get("error");
        let code = err.and_then(|e| e.get("code")).and_then(Value::as_i64);
        let message = err
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown platform error");

        match self.classify(code, message) {
            DeliveryError::ExpiredWindow { message, .. } => DeliveryError::ExpiredWindow {
                recipient: recipient_id.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// Attachment type from the URL's file extension. Anything unrecognized is
/// sent as an image, matching how flows are authored in practice.
fn media_type_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    match path.rsplit('.').next().unwrap_or("") {
        "mp4" | "mov" | "avi" | "webm" | "mkv" => "video",
        "pdf" | "doc" | "docx" | "xls" | "xlsx" | "zip" => "file",
        _ => "image",
    }
}

#[async_trait]
impl DeliveryGateway for GraphApiGateway {
    async fn send(
        &self,
        account: &Account,
        recipient_id: &str,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let token = self.token_for(account)?;
        let body = self.message_body(recipient_id, message);

        let resp = self
            .client
            .post(self.messages_url())
            .query(&[("access_token", token.expose_secret())])
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                code: None,
                message: e.to_string(),
            })?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(self.parse_error(recipient_id, body));
        }

        // Attachments cannot carry text, so a caption goes out as a
        // follow-up message. Best effort; the attachment already landed.
        if let OutboundMessage::Media { caption, .. } = message {
            if !caption.is_empty() {
                let follow_up = self.message_body(
                    recipient_id,
                    &OutboundMessage::text(caption.clone()),
                );
                let result = self
                    .client
                    .post(self.messages_url())
                    .query(&[("access_token", token.expose_secret())])
                    .json(&follow_up)
                    .send()
                    .await;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "caption follow-up failed");
                }
            }
        }

        Ok(DeliveryReceipt {
            message_id: body
                .get("message_id")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    async fn fetch_profile(
        &self,
        account: &Account,
        participant_id: &str,
    ) -> Result<ParticipantProfile, DeliveryError> {
        let token = self.token_for(account)?;

        let resp = self
            .client
            .get(format!("{}/{participant_id}", self.base_url))
            .query(&[
                ("fields", "name,username,profile_pic,is_user_follow_business"),
                ("access_token", token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                code: None,
                message: e.to_string(),
            })?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(self.parse_error(participant_id, body));
        }

        Ok(ParticipantProfile {
            username: body
                .get("username")
                .and_then(Value::as_str)
                .map(String::from),
            name: body.get("name").and_then(Value::as_str).map(String::from),
            profile_picture_url: body
                .get("profile_pic")
                .and_then(Value::as_str)
                .map(String::from),
            is_follower: body
                .get("is_user_follow_business")
                .and_then(Value::as_bool),
        })
    }
}
