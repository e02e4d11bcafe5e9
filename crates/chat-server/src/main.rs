//! chat-server
//!
//! Axum-based HTTP server exposing the tool-calling chat engine: provider
//! listing, conversation CRUD, and buffered or SSE-streamed chat turns.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use chat_core::{ChatService, RoundDriver};
use chat_runtime::{FileConversationStore, OpenAiGateway, tools::default_tools};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ServerConfig, load_providers};
use crate::handlers::{
    chat_handler, chat_stream_handler, create_conversation, delete_conversation, get_conversation, health_check,
    list_conversations, list_models, update_conversation,
};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let providers = load_providers(&config.provider_file)?;

    let tools = default_tools(&config.knowledge_dir);
    tracing::info!("Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }
    let tool_names = tools.names();

    let gateway = Arc::new(OpenAiGateway::from_env()?);
    let store = Arc::new(FileConversationStore::new(&config.data_dir));
    let service = ChatService::new(
        RoundDriver::new(gateway, Arc::new(tools)),
        store,
        Arc::new(providers),
        config.settings(),
    );

    let app = build_router(AppState::new(service, tool_names));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("chat-server running on http://{}", config.bind_addr);
    tracing::info!(
        data_dir = %config.data_dir.display(),
        safe_mode = config.safe_mode,
        watchdog = config.watchdog,
        max_rounds = config.max_rounds,
        "configuration loaded"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        // Conversations
        .route("/api/conversations", get(list_conversations).post(create_conversation))
        .route(
            "/api/conversations/{id}",
            get(get_conversation)
                .patch(update_conversation)
                .delete(delete_conversation),
        )
        // Chat
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", post(chat_stream_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Server shutting down gracefully...");
}
