//! HTTP reader service exposing the card reader to browser and desktop clients.

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::core::protocol::{HealthResponse, ReadCardResponse};
use crate::core::reader::CardSource;

/// Reader service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Reader to use; the first attached reader when unset
    pub reader: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            reader: None,
        }
    }
}

impl ServerConfig {
    /// Base URL clients should use, with IPv6 literals bracketed
    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}/api", self.host, self.port)
        } else {
            format!("http://{}:{}/api", self.host, self.port)
        }
    }

    /// Bind the listener; the host may be an address or a resolvable name
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", self.host, self.port))
    }
}

#[derive(Clone)]
struct ApiState {
    source: Arc<dyn CardSource>,
    reader: Option<String>,
}

/// Routes of the reader service, with CORS open to any origin
pub fn router(source: Arc<dyn CardSource>, reader: Option<String>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/card/read", get(read_card))
        .layer(cors)
        .with_state(ApiState { source, reader })
}

/// Bind and serve until the process is stopped
pub async fn serve(config: &ServerConfig, source: Arc<dyn CardSource>) -> Result<()> {
    let listener = config.bind().await?;
    let addr = listener.local_addr().context("Listener has no local address")?;

    log::info!("Reader service listening on http://{addr}");
    match &config.reader {
        Some(reader) => log::info!("Using reader: {reader}"),
        None => log::info!("Using the first attached reader"),
    }

    axum::serve(listener, router(source, config.reader.clone()))
        .await
        .context("Reader service failed")
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::online())
}

async fn read_card(State(state): State<ApiState>) -> (StatusCode, Json<ReadCardResponse>) {
    let source = Arc::clone(&state.source);
    let reader = state.reader.clone();

    // PC/SC calls block until the card answers
    let result = tokio::task::spawn_blocking(move || source.read_card(reader.as_deref())).await;

    match result {
        Ok(Ok(card)) => {
            log::info!("Card read from '{}': {}", card.reader, card.atr);
            (StatusCode::OK, Json(ReadCardResponse::card(&card)))
        }
        Ok(Err(e)) => {
            log::warn!("Card read failed: {e}");
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(ReadCardResponse::failure(e.user_message())))
        }
        Err(e) => {
            log::error!("Card read task failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ReadCardResponse::failure(format!("System error: {e}"))),
            )
        }
    }
}
