//! Platform webhook endpoints.
//!
//! The platform delivers inbound messages as POST batches and verifies the
//! subscription with a GET challenge handshake. Events inside one batch are
//! processed in order; a failing event is logged and skipped so one bad
//! message cannot block the rest of the batch.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::engine::ChatEngine;
use crate::store::ConversationStore;

/// Shared state for webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub engine: Arc<ChatEngine>,
    pub store: Arc<dyn ConversationStore>,
    /// Token the platform echoes back during subscription verification.
    pub verify_token: String,
}

/// One delivered batch: the receiving account plus its events.
#[derive(Debug, Deserialize)]
pub struct WebhookBatch {
    /// Platform id of the account the events were sent to.
    pub account_id: String,
    #[serde(default)]
    pub events: Vec<crate::model::InboundEvent>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    processed: usize,
    failed: usize,
}

/// GET /webhook
///
/// Subscription verification handshake: echo `hub.challenge` back when the
/// verify token matches.
async fn verify(
    State(state): State<WebhookState>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    if params.mode.as_deref() == Some("subscribe") && params.verify_token == state.verify_token {
        info!("webhook subscription verified");
        params.challenge.into_response()
    } else {
        warn!("webhook verification failed");
        StatusCode::FORBIDDEN.into_response()
    }
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token", default)]
    verify_token: String,
    #[serde(rename = "hub.challenge", default)]
    challenge: String,
}

/// POST /webhook
///
/// Process a batch of inbound events for one account.
async fn receive(
    State(state): State<WebhookState>,
    Json(batch): Json<WebhookBatch>,
) -> impl IntoResponse {
    let account = match state.store.account_by_platform_id(&batch.account_id).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            warn!(account_id = %batch.account_id, "webhook for unknown account");
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "unknown account"})),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "account lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut processed = 0;
    let mut failed = 0;
    for event in &batch.events {
        match state.engine.process_event(&account, event).await {
            Ok(report) => {
                processed += 1;
                info!(
                    conversation_id = %report.conversation_id,
                    kind = ?report.intent.kind,
                    outcome = report.outcome.as_ref().map(|o| o.label()),
                    "event processed"
                );
            }
            Err(e) => {
                failed += 1;
                error!(sender_id = %event.sender_id, error = %e, "event processing failed");
            }
        }
    }

    Json(BatchResponse { processed, failed }).into_response()
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the webhook router.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", get(verify).post(receive))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, IntentPatterns};
    use crate::crm::NullLeadService;
    use crate::delivery::GraphApiGateway;
    use crate::store::LibSqlStore;

    async fn serve() -> String {
        let config = EngineConfig::default();
        let store: Arc<dyn ConversationStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let gateway = Arc::new(GraphApiGateway::new(&config));
        let (engine, _resume_rx) = ChatEngine::new(
            config,
            IntentPatterns::default(),
            Arc::clone(&store),
            gateway,
            Arc::new(NullLeadService),
        );
        let app = webhook_routes(WebhookState {
            engine,
            store,
            verify_token: "sekret".into(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let base = serve().await;
        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn verification_echoes_challenge_for_valid_token() {
        let base = serve().await;
        let resp = reqwest::get(format!(
            "{base}/webhook?hub.mode=subscribe&hub.verify_token=sekret&hub.challenge=42"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "42");

        let resp = reqwest::get(format!(
            "{base}/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=42"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 403);
    }

    #[tokio::test]
    async fn batch_for_unknown_account_is_404() {
        let base = serve().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/webhook"))
            .json(&serde_json::json!({
                "account_id": "nobody",
                "events": [{"sender_id": "1", "message_text": "salom"}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
