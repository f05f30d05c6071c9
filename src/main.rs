use std::sync::Arc;

use convoflow::config::{EngineConfig, IntentPatterns};
use convoflow::crm::NullLeadService;
use convoflow::delivery::GraphApiGateway;
use convoflow::engine::ChatEngine;
use convoflow::store::{ConversationStore, LibSqlStore};
use convoflow::webhook::{WebhookState, webhook_routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let port: u16 = std::env::var("CONVOFLOW_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let verify_token = std::env::var("CONVOFLOW_VERIFY_TOKEN").unwrap_or_else(|_| {
        eprintln!("Error: CONVOFLOW_VERIFY_TOKEN not set");
        std::process::exit(1);
    });

    eprintln!("💬 ConvoFlow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", port);
    eprintln!("   Health:  http://0.0.0.0:{}/health\n", port);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("CONVOFLOW_DB_PATH").unwrap_or_else(|_| "./data/convoflow.db".to_string());
    let store: Arc<dyn ConversationStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );

    // ── Delivery gateway ────────────────────────────────────────────────
    let config = EngineConfig::default();
    let mut gateway = GraphApiGateway::new(&config);

    // Single-account deployments pass credentials via the environment;
    // multi-account ones provision tokens through the dashboard instead.
    if let (Ok(account_id), Ok(token)) = (
        std::env::var("CONVOFLOW_ACCOUNT_ID"),
        std::env::var("CONVOFLOW_PAGE_TOKEN"),
    ) {
        match account_id.parse::<uuid::Uuid>() {
            Ok(id) => gateway.set_token(id, secrecy::SecretString::from(token)),
            Err(_) => eprintln!("Warning: CONVOFLOW_ACCOUNT_ID is not a valid UUID, ignoring"),
        }
    }

    // ── Intent patterns ─────────────────────────────────────────────────
    let patterns = match std::env::var("CONVOFLOW_PATTERNS_PATH") {
        Ok(path) => IntentPatterns::load(std::path::Path::new(&path))?,
        Err(_) => IntentPatterns::default(),
    };

    // ── Engine ──────────────────────────────────────────────────────────
    let (engine, resume_rx) = ChatEngine::new(
        config,
        patterns,
        Arc::clone(&store),
        Arc::new(gateway),
        Arc::new(NullLeadService),
    );
    let _resume_handle = engine.spawn_resume_loop(resume_rx);

    // ── Webhook server ──────────────────────────────────────────────────
    let app = webhook_routes(WebhookState {
        engine,
        store,
        verify_token,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "webhook server started");
    axum::serve(listener, app).await?;

    Ok(())
}
