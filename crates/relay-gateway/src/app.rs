use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use relay_core::RelayConfig;
use relay_telegram::{Messenger, Pipeline, TelegramClient};

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub pipeline: Pipeline,
    http: reqwest::Client,
    /// Bot API clients by token, built on first use.
    messengers: DashMap<String, Arc<dyn Messenger>>,
}

impl AppState {
    pub fn new(config: RelayConfig, pipeline: Pipeline, http: reqwest::Client) -> Self {
        Self {
            config,
            pipeline,
            http,
            messengers: DashMap::new(),
        }
    }

    /// Use `messenger` for `token` instead of a real Bot API client.
    #[cfg(test)]
    pub fn with_messenger(self, token: &str, messenger: Arc<dyn Messenger>) -> Self {
        self.messengers.insert(token.to_string(), messenger);
        self
    }

    pub fn messenger(&self, token: &str) -> Arc<dyn Messenger> {
        self.messengers
            .entry(token.to_string())
            .or_insert_with(|| {
                Arc::new(TelegramClient::new(
                    self.http.clone(),
                    &self.config.telegram.api_domain,
                    token,
                ))
            })
            .clone()
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/telegram/{token}/webhook",
            post(crate::http::telegram::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
