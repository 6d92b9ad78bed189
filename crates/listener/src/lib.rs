//! Relay HTTP surface.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `POST /github` | GitHub webhook deliveries, verified with `X-Hub-Signature-256` and handed to the [`dispatch::Dispatcher`] |
//! | `POST /register` | Store a registration (`Authorization: Token <api token>`) |
//! | `DELETE /register` | Remove a registration by identity |
//! | `GET /health` | Liveness probe |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Transport, authentication and status-code mapping live
//! here. Every decision about what to trigger stays in `dispatch`.

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use dispatch::{Dispatcher, RegistrationWriter};
use tokio::net::TcpListener;
use tracing::info;

mod health;
mod register;
mod signature;
mod webhook;

pub use health::health_handler;
pub use register::{register_handler, unregister_handler, RegisterError};
pub use signature::{parse_signature_header, sign, verify_signature};
pub use webhook::{webhook_handler, WebhookError};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    dispatcher: Dispatcher,
    registrations: Arc<dyn RegistrationWriter>,
    webhook_secret: Vec<u8>,
    api_token: String,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        dispatcher: Dispatcher,
        registrations: Arc<dyn RegistrationWriter>,
        webhook_secret: impl Into<Vec<u8>>,
        api_token: impl Into<String>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                dispatcher,
                registrations,
                webhook_secret: webhook_secret.into(),
                api_token: api_token.into(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn registrations(&self) -> &dyn RegistrationWriter {
        self.inner.registrations.as_ref()
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.inner.webhook_secret
    }

    pub fn api_token(&self) -> &str {
        &self.inner.api_token
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dispatcher", &self.inner.dispatcher)
            .field("started_at", &self.inner.started_at)
            .finish_non_exhaustive()
    }
}

/// Builds the router with every Relay endpoint.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/github", post(webhook_handler))
        .route("/register", post(register_handler).delete(unregister_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening for webhooks");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
