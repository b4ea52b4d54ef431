//! Session lifecycle management.
//!
//! The manager owns the session registry and one background task per
//! session. A session's state is mutated only by its owning task (via the
//! event stream it drains); the registry lock protects membership only.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use magi_core::budget::TruncatingSummarizer;
use magi_core::config::{EngineConfig, ResolvedLlm};
use magi_core::engine::{CancelFlag, ConsensusEngine, EngineDeps, FinalResult, SessionOptions};
use magi_core::error::{MagiError, MagiResult};
use magi_core::events::{Envelope, ErrorCode, Event, Phase, UnitState};
use magi_core::guardrails::GuardrailsAdapter;
use magi_core::llm::ChatProvider;
use magi_core::persona::{PersonaManager, PersonaName};
use magi_core::providers::HttpChatProvider;
use magi_core::security::SecurityFilter;
use magi_core::template::TemplateLoader;
use magi_core::{ConcurrencyController, PromptSet, StreamingEmitter};

use super::broadcast::EventBroadcaster;
use crate::logging::DeliberationTimer;

/// Builds the chat provider for one persona's resolved settings.
pub type ProviderFactory =
    Arc<dyn Fn(&ResolvedLlm) -> MagiResult<Arc<dyn ChatProvider>> + Send + Sync>;

/// The production factory: the OpenAI-compatible HTTP adapter.
pub fn http_provider_factory() -> ProviderFactory {
    Arc::new(|resolved| {
        Ok(Arc::new(HttpChatProvider::new(resolved.clone())?) as Arc<dyn ChatProvider>)
    })
}

/// Observable session state.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub prompt: String,
    pub options: SessionOptions,
    pub phase: Phase,
    pub progress: u8,
    pub unit_states: BTreeMap<PersonaName, UnitState>,
    pub final_result: Option<FinalResult>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

/// Cancel request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelStatus {
    /// The session is still unwinding toward CANCELLED.
    Cancelling,
    /// The session is already terminal; repeating cancel is a no-op.
    Cancelled,
}

/// Lifecycle knobs.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Session retention after creation.
    pub ttl: Duration,
    /// Sweep cadence for expired sessions.
    pub sweep_interval: Duration,
    /// Simultaneously running sessions.
    pub max_concurrency: usize,
    /// Default per-session deadline.
    pub default_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            max_concurrency: 10,
            default_timeout: Duration::from_secs(120),
        }
    }
}

struct SessionHandle {
    session: Arc<RwLock<Session>>,
    cancel: CancelFlag,
    #[allow(dead_code, reason = "held so the task is owned by its session entry")]
    task: JoinHandle<()>,
}

/// Owns sessions and their background tasks.
pub struct SessionManager {
    engine_config: EngineConfig,
    limits: SessionLimits,
    controller: Arc<ConcurrencyController>,
    factory: ProviderFactory,
    broadcaster: Arc<EventBroadcaster>,
    templates: Option<Arc<TemplateLoader>>,
    registry: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.registry.read().len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl SessionManager {
    /// Build the manager and start its TTL sweeper.
    pub fn new(
        engine_config: EngineConfig,
        limits: SessionLimits,
        controller: Arc<ConcurrencyController>,
        factory: ProviderFactory,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Arc<Self> {
        let templates = engine_config.templates.dir.as_ref().map(|dir| {
            Arc::new(TemplateLoader::new(
                dir.clone(),
                Duration::from_secs(engine_config.templates.ttl_secs),
            ))
        });
        let manager = Arc::new(Self {
            engine_config,
            limits,
            controller,
            factory,
            broadcaster,
            templates,
            registry: RwLock::new(HashMap::new()),
        });
        Self::spawn_sweeper(&manager);
        manager
    }

    /// Create a session and start its deliberation task.
    pub async fn create(&self, prompt: String, options: SessionOptions) -> MagiResult<Uuid> {
        let running = self
            .registry
            .read()
            .values()
            .filter(|h| !h.session.read().phase.is_terminal())
            .count();
        if running >= self.limits.max_concurrency {
            return Err(MagiError::ConcurrencyLimit { waited_ms: 0 });
        }

        let id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let emitter = StreamingEmitter::new(&self.engine_config.streaming);
        let now = Utc::now();

        let session = Arc::new(RwLock::new(Session {
            id,
            prompt: prompt.clone(),
            options: options.clone(),
            phase: Phase::Queued,
            progress: 0,
            unit_states: PersonaName::ALL
                .iter()
                .map(|&p| (p, UnitState::Idle))
                .collect(),
            final_result: None,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.limits.ttl)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            cancel_requested: false,
        }));

        self.broadcaster.register(id);

        let prompts = match &self.templates {
            Some(loader) => loader.load_prompt_set().await,
            None => PromptSet::default(),
        };

        let deps = EngineDeps {
            controller: Arc::clone(&self.controller),
            providers: self.build_providers(&options)?,
            summarizer: Arc::new(TruncatingSummarizer),
            guardrails: GuardrailsAdapter::with_defaults(self.engine_config.guardrails.clone()),
            security: SecurityFilter::default(),
            personas: PersonaManager::new(),
            prompts,
            emitter: emitter.clone(),
            cancel: cancel.clone(),
        };
        let engine = ConsensusEngine::new(id, self.engine_config.clone(), &options, deps)?;

        let deadline = options
            .timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(self.limits.default_timeout);

        let task = tokio::spawn(run_session(
            engine,
            emitter,
            Arc::clone(&session),
            Arc::clone(&self.broadcaster),
            prompt,
            deadline,
            id,
        ));

        self.registry.write().insert(
            id,
            SessionHandle {
                session,
                cancel,
                task,
            },
        );

        tracing::info!(session_id = %id, "session created");
        Ok(id)
    }

    /// Request cancellation. Idempotent: terminal sessions report their
    /// terminal status unchanged.
    pub fn cancel(&self, id: Uuid) -> Option<CancelStatus> {
        let registry = self.registry.read();
        let handle = registry.get(&id)?;
        let mut session = handle.session.write();
        if session.phase.is_terminal() {
            return Some(CancelStatus::Cancelled);
        }
        session.cancel_requested = true;
        handle.cancel.set();
        tracing::info!(session_id = %id, "session cancel requested");
        Some(CancelStatus::Cancelling)
    }

    /// Snapshot a session's observable state.
    pub fn get(&self, id: Uuid) -> Option<Session> {
        self.registry
            .read()
            .get(&id)
            .map(|h| h.session.read().clone())
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Drop sessions past their expiry, cancelling any still running.
    pub fn sweep(&self) {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .registry
            .read()
            .iter()
            .filter(|(_, h)| now > h.session.read().expires_at)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            if let Some(handle) = self.registry.write().remove(&id) {
                handle.cancel.set();
                self.broadcaster.close_session(id);
                tracing::info!(session_id = %id, "session expired and removed");
            }
        }
    }

    fn spawn_sweeper(manager: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(manager);
        let interval = manager.limits.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(manager) => manager.sweep(),
                    None => break,
                }
            }
        });
    }

    fn build_providers(
        &self,
        options: &SessionOptions,
    ) -> MagiResult<BTreeMap<PersonaName, Arc<dyn ChatProvider>>> {
        let mut config = self.engine_config.clone();
        if let Some(model) = &options.model {
            config.llm.model = model.clone();
        }
        let mut providers = BTreeMap::new();
        for persona in PersonaName::ALL {
            let resolved = config.resolve_llm(persona);
            providers.insert(persona, (self.factory)(&resolved)?);
        }
        Ok(providers)
    }
}

/// Drive one session: drain engine events into the broadcaster, apply the
/// session deadline, and record the terminal state.
async fn run_session(
    engine: ConsensusEngine,
    emitter: StreamingEmitter,
    session: Arc<RwLock<Session>>,
    broadcaster: Arc<EventBroadcaster>,
    prompt: String,
    deadline: Duration,
    id: Uuid,
) {
    let timer = DeliberationTimer::start(id);
    let drain = {
        let emitter = emitter.clone();
        let session = Arc::clone(&session);
        let broadcaster = Arc::clone(&broadcaster);
        tokio::spawn(async move {
            while let Some(envelope) = emitter.recv().await {
                apply_event(&session, &envelope);
                broadcaster.publish(id, &envelope);
            }
        })
    };

    match tokio::time::timeout(deadline, engine.run(&prompt)).await {
        Ok(outcome) => {
            let _ = drain.await;
            {
                let mut session = session.write();
                session.phase = outcome.phase;
                if outcome.phase == Phase::Resolved {
                    session.progress = 100;
                }
                session.final_result = outcome.final_result;
            }
            timer.finish(outcome.phase);
        }
        Err(_elapsed) => {
            // The engine future was dropped mid-flight; permits were
            // released by their RAII guards. Report the timeout ourselves.
            emitter.close();
            let _ = drain.await;
            tracing::error!(session_id = %id, deadline_secs = deadline.as_secs(), "session deadline exceeded");
            session.write().phase = Phase::Error;
            timer.finish(Phase::Error);
            broadcaster.publish(
                id,
                &Envelope::new(
                    id,
                    Event::Error {
                        code: ErrorCode::Timeout,
                        message: format!("session timed out after {}s", deadline.as_secs()),
                    },
                ),
            );
            broadcaster.publish(id, &Envelope::new(id, Event::Phase { phase: Phase::Error }));
        }
    }

    broadcaster.close_session(id);
}

fn apply_event(session: &Arc<RwLock<Session>>, envelope: &Envelope) {
    let mut session = session.write();
    match &envelope.event {
        Event::Phase { phase } => session.phase = *phase,
        Event::Progress { pct } => session.progress = *pct,
        Event::Unit { unit, state, .. } => {
            session.unit_states.insert(*unit, *state);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use magi_core::llm::{ChatRequest, ChatUsage, LLMResponse};

    struct ConstProvider;

    #[async_trait]
    impl ChatProvider for ConstProvider {
        fn name(&self) -> &str {
            "const"
        }

        async fn complete(&self, _request: &ChatRequest) -> MagiResult<LLMResponse> {
            Ok(LLMResponse {
                content: r#"{"vote": "APPROVE", "reason": "fine"}"#.to_string(),
                usage: ChatUsage::default(),
                model: "const".to_string(),
            })
        }
    }

    fn stub_factory() -> ProviderFactory {
        Arc::new(|_resolved| Ok(Arc::new(ConstProvider) as Arc<dyn ChatProvider>))
    }

    fn manager(limits: SessionLimits) -> Arc<SessionManager> {
        SessionManager::new(
            EngineConfig::default(),
            limits,
            Arc::new(ConcurrencyController::default()),
            stub_factory(),
            Arc::new(EventBroadcaster::new()),
        )
    }

    async fn wait_terminal(manager: &SessionManager, id: Uuid) -> Session {
        for _ in 0..200 {
            if let Some(session) = manager.get(id) {
                if session.phase.is_terminal() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached a terminal phase");
    }

    #[tokio::test]
    async fn test_session_runs_to_resolution() {
        let manager = manager(SessionLimits::default());
        let id = manager
            .create("Should we ship?".to_string(), SessionOptions::default())
            .await
            .unwrap();

        let session = wait_terminal(&manager, id).await;
        assert_eq!(session.phase, Phase::Resolved);
        assert_eq!(session.progress, 100);
        let result = session.final_result.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(session
            .unit_states
            .values()
            .all(|&s| s == UnitState::Voted));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_on_terminal_sessions() {
        let manager = manager(SessionLimits::default());
        let id = manager
            .create("Should we ship?".to_string(), SessionOptions::default())
            .await
            .unwrap();
        wait_terminal(&manager, id).await;

        assert_eq!(manager.cancel(id), Some(CancelStatus::Cancelled));
        assert_eq!(manager.cancel(id), Some(CancelStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let manager = manager(SessionLimits::default());
        assert_eq!(manager.cancel(Uuid::new_v4()), None);
    }

    #[tokio::test]
    async fn test_max_concurrency_enforced() {
        // Hold the first session open with a provider that never resolves.
        struct BlockingProvider;

        #[async_trait]
        impl ChatProvider for BlockingProvider {
            fn name(&self) -> &str {
                "blocking"
            }

            async fn complete(&self, _request: &ChatRequest) -> MagiResult<LLMResponse> {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }

        let manager = SessionManager::new(
            EngineConfig::default(),
            SessionLimits {
                max_concurrency: 1,
                ..Default::default()
            },
            Arc::new(ConcurrencyController::default()),
            Arc::new(|_| Ok(Arc::new(BlockingProvider) as Arc<dyn ChatProvider>)),
            Arc::new(EventBroadcaster::new()),
        );

        let first = manager
            .create("held open".to_string(), SessionOptions::default())
            .await
            .unwrap();
        let second = manager
            .create("rejected".to_string(), SessionOptions::default())
            .await;
        assert!(matches!(second, Err(MagiError::ConcurrencyLimit { .. })));

        let _ = manager.cancel(first);
    }

    #[tokio::test]
    async fn test_session_timeout_reports_error_phase() {
        struct BlockingProvider;

        #[async_trait]
        impl ChatProvider for BlockingProvider {
            fn name(&self) -> &str {
                "blocking"
            }

            async fn complete(&self, _request: &ChatRequest) -> MagiResult<LLMResponse> {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }

        let manager = SessionManager::new(
            EngineConfig::default(),
            SessionLimits::default(),
            Arc::new(ConcurrencyController::default()),
            Arc::new(|_| Ok(Arc::new(BlockingProvider) as Arc<dyn ChatProvider>)),
            Arc::new(EventBroadcaster::new()),
        );

        let id = manager
            .create(
                "never finishes".to_string(),
                SessionOptions {
                    timeout_sec: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let session = wait_terminal(&manager, id).await;
        assert_eq!(session.phase, Phase::Error);
        assert!(session.final_result.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_sessions() {
        let limits = SessionLimits {
            ttl: Duration::from_secs(0),
            ..Default::default()
        };
        let manager = manager(limits);
        let id = manager
            .create("short lived".to_string(), SessionOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.sweep();
        assert!(manager.get(id).is_none());
    }
}
