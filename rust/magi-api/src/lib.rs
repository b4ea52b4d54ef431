//! MAGI API - Observer Gateway for the Consensus Engine
//!
//! This crate hosts the deliberation runtime behind an HTTP + WebSocket
//! surface for an observer UI:
//!
//! - **REST**: session creation, cancellation and snapshots
//! - **WebSocket**: per-session server→client event streams
//! - **Lifecycle**: TTL sweeping, session deadlines, concurrency caps
//!
//! # Architecture
//!
//! - [`config`]: layered configuration loading
//! - [`api`]: HTTP and WebSocket endpoints
//! - [`runtime`]: session manager and event broadcaster
//! - [`server`]: application wiring and middleware
//!
//! # Example
//!
//! ```rust,ignore
//! use magi_api::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let app = create_app(config)?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod config;
pub mod logging;
pub mod runtime;
pub mod server;

use std::sync::Arc;

use config::AppConfig;
use runtime::SessionManager;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Session lifecycle manager.
    pub sessions: Arc<SessionManager>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("sessions", &self.sessions)
            .finish()
    }
}
