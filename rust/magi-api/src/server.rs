//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use magi_core::ConcurrencyController;

use crate::api;
use crate::config::AppConfig;
use crate::logging::InitStep;
use crate::runtime::{
    http_provider_factory, EventBroadcaster, ProviderFactory, SessionLimits, SessionManager,
};
use crate::AppState;

/// MAGI API version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Startup steps logged by `create_app`.
const INIT_STEPS: usize = 4;

/// Create the application with all routes and middleware, using the
/// production HTTP chat provider.
pub fn create_app(config: AppConfig) -> anyhow::Result<Router> {
    create_app_with_factory(config, http_provider_factory())
}

/// Create the application with an explicit provider factory. Tests inject
/// scripted providers through this entry point.
pub fn create_app_with_factory(
    config: AppConfig,
    factory: ProviderFactory,
) -> anyhow::Result<Router> {
    tracing::info!("🧠 MAGI API v{} starting", VERSION);

    // [1/4] Engine configuration
    let step = InitStep::begin(1, INIT_STEPS, "Engine");
    config.validate()?;
    if config.engine.llm.api_key.is_none() {
        tracing::warn!("no API key configured; LLM requests will fail");
    }
    step.done(format!(
        "model={} rounds={} threshold={:?}",
        config.engine.llm.model, config.engine.debate_rounds, config.engine.voting_threshold
    ));

    // [2/4] Concurrency controller — the single process-wide instance,
    // injected into every engine from here.
    let step = InitStep::begin(2, INIT_STEPS, "Concurrency");
    let controller = Arc::new(ConcurrencyController::new(
        config.engine.llm_concurrency_limit,
    ));
    step.done(format!("🚦 {} LLM call slots", controller.capacity()));

    // [3/4] Session manager + broadcaster
    let step = InitStep::begin(3, INIT_STEPS, "Sessions");
    let broadcaster = Arc::new(EventBroadcaster::new());
    let limits = SessionLimits {
        ttl: Duration::from_secs(config.session.ttl_secs),
        sweep_interval: Duration::from_secs(config.session.sweep_interval_secs),
        max_concurrency: config.session.max_concurrency,
        default_timeout: Duration::from_secs(config.session.timeout_secs),
    };
    let sessions = SessionManager::new(
        config.engine.clone(),
        limits,
        controller,
        factory,
        broadcaster,
    );
    step.done(format!("📋 max {} concurrent", config.session.max_concurrency));

    // [4/4] Router with middleware
    let step = InitStep::begin(4, INIT_STEPS, "Router");
    let state = AppState {
        config: Arc::new(config.clone()),
        sessions,
    };

    let app = api::create_router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    step.done("🌐 routes + middleware configured");

    tracing::info!("✅ MAGI API server created successfully");

    Ok(app)
}
