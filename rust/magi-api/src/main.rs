//! MAGI API - Main Entry Point
//!
//! Runs the observer gateway (`serve`) or a single in-process
//! deliberation (`ask`). The `ask` exit code encodes the decision:
//! 0 APPROVE, 1 DENY, 2 CONDITIONAL, 3 or above for engine/system errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use magi_api::config::AppConfig;
use magi_api::runtime::http_provider_factory;
use magi_api::server::create_app;
use magi_core::budget::TruncatingSummarizer;
use magi_core::engine::{CancelFlag, ConsensusEngine, EngineDeps, SessionOptions};
use magi_core::events::Event;
use magi_core::guardrails::GuardrailsAdapter;
use magi_core::persona::{PersonaManager, PersonaName};
use magi_core::quorum::VotingThreshold;
use magi_core::security::SecurityFilter;
use magi_core::template::TemplateLoader;
use magi_core::{ConcurrencyController, PromptSet, StreamingEmitter};

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "magi-api")]
#[command(about = "MAGI API - Three-agent consensus engine gateway")]
#[command(version)]
struct Args {
    /// Host to bind to.
    #[arg(long, env = "MAGI_API_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, env = "MAGI_API_PORT", default_value = "8080")]
    port: u16,

    /// Log level; falls back to `logging.level` from the configuration.
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the observer gateway (default).
    Serve,
    /// Run one deliberation and exit with the decision code.
    Ask {
        /// The deliberation prompt.
        prompt: String,

        /// Debate rounds override.
        #[arg(long)]
        rounds: Option<u32>,

        /// Model override.
        #[arg(long)]
        model: Option<String>,

        /// Require unanimity instead of majority.
        #[arg(long)]
        unanimous: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();

    let config = AppConfig::load()?;
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&log_level);

    match args.command.take() {
        None | Some(Command::Serve) => serve(args, config).await,
        Some(Command::Ask {
            prompt,
            rounds,
            model,
            unanimous,
        }) => {
            let mut config = config;
            if unanimous {
                config.engine.voting_threshold = VotingThreshold::Unanimous;
            }
            let options = SessionOptions {
                model,
                max_rounds: rounds,
                timeout_sec: None,
            };
            let code = ask(config, prompt, options).await.unwrap_or_else(|err| {
                eprintln!("error: {err}");
                3
            });
            std::process::exit(code);
        }
    }
}

async fn serve(args: Args, config: AppConfig) -> anyhow::Result<()> {
    tracing::info!(
        "Starting MAGI API v{} (observer gateway)",
        env!("CARGO_PKG_VERSION")
    );

    let app = create_app(config)?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Run one deliberation in-process and return the exit code.
async fn ask(config: AppConfig, prompt: String, options: SessionOptions) -> anyhow::Result<i32> {
    let controller = Arc::new(ConcurrencyController::new(
        config.engine.llm_concurrency_limit,
    ));
    let factory = http_provider_factory();

    let mut engine_config = config.engine.clone();
    if let Some(model) = &options.model {
        engine_config.llm.model = model.clone();
    }
    let mut providers = BTreeMap::new();
    for persona in PersonaName::ALL {
        let resolved = engine_config.resolve_llm(persona);
        providers.insert(persona, factory(&resolved)?);
    }

    let prompts = match &config.engine.templates.dir {
        Some(dir) => {
            let loader = TemplateLoader::new(
                dir.clone(),
                Duration::from_secs(config.engine.templates.ttl_secs),
            );
            loader.load_prompt_set().await
        }
        None => PromptSet::default(),
    };

    let emitter = StreamingEmitter::new(&config.engine.streaming);
    let deps = EngineDeps {
        controller,
        providers,
        summarizer: Arc::new(TruncatingSummarizer),
        guardrails: GuardrailsAdapter::with_defaults(config.engine.guardrails.clone()),
        security: SecurityFilter::default(),
        personas: PersonaManager::new(),
        prompts,
        emitter: emitter.clone(),
        cancel: CancelFlag::new(),
    };
    let engine = ConsensusEngine::new(Uuid::new_v4(), config.engine.clone(), &options, deps)?;

    // Narrate progress to stderr while the engine runs.
    let narrator = tokio::spawn(async move {
        while let Some(envelope) = emitter.recv().await {
            match &envelope.event {
                Event::Phase { phase } => eprintln!("── {phase}"),
                Event::Unit { unit, state, message, .. } => match message {
                    Some(message) => eprintln!("   {unit}: {state:?} ({message})"),
                    None => eprintln!("   {unit}: {state:?}"),
                },
                Event::Error { code, message } => eprintln!("!! {code:?}: {message}"),
                _ => {}
            }
        }
    });

    let deadline = Duration::from_secs(config.session.timeout_secs);
    let outcome = match tokio::time::timeout(deadline, engine.run(&prompt)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => {
            eprintln!("deliberation timed out after {}s", deadline.as_secs());
            return Ok(3);
        }
    };
    let _ = narrator.await;

    match outcome.final_result {
        Some(result) => {
            println!("decision: {}", result.decision);
            for (persona, vote) in &result.votes {
                println!("  {persona}: {} — {}", vote.vote, vote.reason);
                if let Some(conditions) = &vote.conditions {
                    for condition in conditions {
                        println!("    condition: {condition}");
                    }
                }
            }
            if let Some(summary) = &result.summary {
                println!("summary: {summary}");
            }
            Ok(result.exit_code)
        }
        None => Ok(3),
    }
}

/// Initialize tracing/logging. The level comes from `--log-level` /
/// `RUST_LOG` when given, otherwise from `logging.level` in the
/// configuration; either accepts full filter directives.
fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
