//! The consensus engine: a phased state machine over three agents.
//!
//! One engine drives one session. Phases advance monotonically along
//! THINKING → DEBATE → VOTING → RESOLVED; CANCELLED and ERROR are terminal
//! and may replace any non-terminal phase. Agent operations within a phase
//! run in parallel and are tolerated failing down to the quorum floor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::agent::{Agent, DebateOutput, PromptSet};
use crate::budget::{ContextEntry, Summarizer, TokenBudgetManager};
use crate::concurrency::ConcurrencyController;
use crate::config::EngineConfig;
use crate::emitter::StreamingEmitter;
use crate::error::{MagiError, MagiResult};
use crate::events::{Envelope, Event, LogLevel, PersonaVote, Phase, UnitState};
use crate::guardrails::{denial_to_error, GuardrailsAdapter};
use crate::llm::{ChatProvider, LLMClient};
use crate::persona::{PersonaManager, PersonaName};
use crate::quorum::{QuorumManager, VotingTally};
use crate::schema::Vote;
use crate::security::SecurityFilter;

/// Caller-supplied per-session options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Model override applied to the global default (persona overrides
    /// still win).
    #[serde(default)]
    pub model: Option<String>,
    /// Debate round override.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// Session deadline override in seconds.
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

/// Cooperative cancellation flag shared between a session and its engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next phase boundary or await.
    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        while !self.is_set() {
            self.inner.notify.notified().await;
        }
    }
}

/// The deliberation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub decision: Vote,
    pub votes: BTreeMap<PersonaName, PersonaVote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub exit_code: i32,
    pub partial_results: bool,
}

/// What a finished engine reports back to its session.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub phase: Phase,
    pub final_result: Option<FinalResult>,
}

/// Injected collaborators; everything an engine does not own outright.
pub struct EngineDeps {
    /// Process-wide LLM call limiter.
    pub controller: Arc<ConcurrencyController>,
    /// Chat provider per persona.
    pub providers: BTreeMap<PersonaName, Arc<dyn ChatProvider>>,
    /// Digest generator for budget reduction.
    pub summarizer: Arc<dyn Summarizer>,
    /// Pre-filter guardrail chain.
    pub guardrails: GuardrailsAdapter,
    /// Prompt sanitizer.
    pub security: SecurityFilter,
    /// The council.
    pub personas: PersonaManager,
    /// Prompt bodies for think/debate/vote.
    pub prompts: PromptSet,
    /// Event sink owned by this session.
    pub emitter: StreamingEmitter,
    /// Cooperative cancel flag.
    pub cancel: CancelFlag,
}

impl std::fmt::Debug for EngineDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineDeps")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Phase state machine for one session.
pub struct ConsensusEngine {
    session_id: Uuid,
    config: EngineConfig,
    rounds: u32,
    agents: Vec<Agent>,
    quorum: QuorumManager,
    budget: TokenBudgetManager,
    emitter: StreamingEmitter,
    guardrails: GuardrailsAdapter,
    security: SecurityFilter,
    cancel: CancelFlag,
    unit_states: BTreeMap<PersonaName, UnitState>,
    last_progress: u8,
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusEngine")
            .field("session_id", &self.session_id)
            .field("rounds", &self.rounds)
            .finish()
    }
}

impl ConsensusEngine {
    /// Build an engine for one session.
    pub fn new(
        session_id: Uuid,
        mut config: EngineConfig,
        options: &SessionOptions,
        deps: EngineDeps,
    ) -> MagiResult<Self> {
        if let Some(model) = &options.model {
            config.llm.model = model.clone();
        }
        let rounds = options.max_rounds.unwrap_or(config.debate_rounds).max(1);

        let mut agents = Vec::with_capacity(PersonaName::ALL.len());
        for persona in PersonaName::ALL {
            let provider = deps
                .providers
                .get(&persona)
                .ok_or_else(|| {
                    MagiError::Configuration(format!("no chat provider for {persona}"))
                })?;
            let resolved = config.resolve_llm(persona);
            let client = LLMClient::new(
                Arc::clone(provider),
                resolved,
                Arc::clone(&deps.controller),
            );
            agents.push(Agent::new(
                deps.personas.get(persona).clone(),
                client,
                deps.prompts.clone(),
                config.schema_retry_count,
            ));
        }

        let quorum = QuorumManager::new(config.quorum_threshold, config.schema_retry_count);
        let budget = TokenBudgetManager::new(Arc::clone(&deps.summarizer));
        let unit_states = PersonaName::ALL
            .iter()
            .map(|&p| (p, UnitState::Idle))
            .collect();

        Ok(Self {
            session_id,
            config,
            rounds,
            agents,
            quorum,
            budget,
            emitter: deps.emitter,
            guardrails: deps.guardrails,
            security: deps.security,
            cancel: deps.cancel,
            unit_states,
            last_progress: 0,
        })
    }

    /// Drive the session to a terminal phase.
    pub async fn run(mut self, prompt: &str) -> EngineOutcome {
        if self.cancel.is_set() {
            return self.finish_cancelled().await;
        }

        // Guardrail chain runs before the security filter.
        let verdict = self.guardrails.review(prompt).await;
        for line in verdict.audit_lines.clone() {
            self.emit_log(LogLevel::Critical, line).await;
        }
        if let Some(err) = denial_to_error(&verdict) {
            return self.fail(err).await;
        }

        let sanitized = self.security.sanitize(prompt);
        if sanitized.removed_patterns[0].pattern_id != "none" {
            let lines: Vec<String> = sanitized
                .removed_patterns
                .iter()
                .map(|hit| format!("masked {} fragment(s) of '{}'", hit.count, hit.pattern_id))
                .collect();
            self.emit_event(Event::Log {
                level: LogLevel::Warn,
                unit: None,
                lines,
            })
            .await;
        }
        let prompt = sanitized.sanitized_text;

        // ── THINKING ─────────────────────────────────────────────
        self.set_phase(Phase::Thinking).await;
        self.set_progress(10).await;
        for persona in self.quorum.alive_personas() {
            self.set_unit(persona, UnitState::Thinking, None).await;
        }

        let thinking = {
            let agents = self.alive_agents();
            let prompt = prompt.clone();
            let gathered = self
                .gather(join_all(agents.into_iter().map(|agent| {
                    let prompt = prompt.clone();
                    async move {
                        let deadline = agent.timeout();
                        let result =
                            match tokio::time::timeout(deadline, agent.think(&prompt)).await {
                                Ok(result) => result,
                                Err(_elapsed) => Err(MagiError::LlmTimeout {
                                    seconds: deadline.as_secs(),
                                }),
                            };
                        (agent.name(), result)
                    }
                })))
                .await;
            match gathered {
                Some(results) => results,
                None => return self.finish_cancelled().await,
            }
        };

        let mut transcript: Vec<ContextEntry> = Vec::new();
        let mut previous_round: Vec<DebateOutput> = Vec::new();
        for (persona, result) in thinking {
            match result {
                Ok(output) => {
                    self.quorum.note_success(persona);
                    transcript.push(ContextEntry::new(persona, 0, output.content.clone()));
                    previous_round.push(DebateOutput {
                        persona,
                        content: output.content,
                        round: 0,
                        timestamp: output.timestamp,
                    });
                }
                Err(err) => {
                    self.quorum.note_failure(persona, &err.to_string());
                    self.emit_log(
                        LogLevel::Warn,
                        format!("{persona} failed during thinking: {err}"),
                    )
                    .await;
                }
            }
        }

        if let Err(err) = self.quorum.check() {
            return self.fail(err).await;
        }
        if self.cancel.is_set() {
            return self.finish_cancelled().await;
        }

        // ── DEBATE ───────────────────────────────────────────────
        self.set_phase(Phase::Debate).await;
        self.set_progress(40).await;

        for round in 1..=self.rounds {
            if self.cancel.is_set() {
                return self.finish_cancelled().await;
            }

            let budget_result = self
                .budget
                .enforce_budget(
                    std::mem::take(&mut transcript),
                    self.config.token_budget,
                    Phase::Debate,
                )
                .await;
            transcript = budget_result.entries;
            if let Some(reduction) = budget_result.reduction {
                self.emit_log(
                    LogLevel::Info,
                    format!(
                        "context reduced {} -> {} tokens (summary_applied={})",
                        reduction.size_before, reduction.size_after, reduction.summary_applied
                    ),
                )
                .await;
            }

            for persona in self.quorum.alive_personas() {
                self.set_unit(persona, UnitState::Debating, None).await;
            }

            let debated = {
                let agents = self.alive_agents();
                let prompt = prompt.clone();
                let previous = previous_round.clone();
                let gathered = self
                    .gather(join_all(agents.into_iter().map(|agent| {
                        let prompt = prompt.clone();
                        let previous = previous.clone();
                        async move {
                            let deadline = agent.timeout();
                            let result = match tokio::time::timeout(
                                deadline,
                                agent.debate(&prompt, &previous, round),
                            )
                            .await
                            {
                                Ok(result) => result,
                                Err(_elapsed) => Err(MagiError::LlmTimeout {
                                    seconds: deadline.as_secs(),
                                }),
                            };
                            (agent.name(), result)
                        }
                    })))
                    .await;
                match gathered {
                    Some(results) => results,
                    None => return self.finish_cancelled().await,
                }
            };

            let mut next_round = Vec::new();
            for (persona, result) in debated {
                match result {
                    Ok(output) => {
                        self.quorum.note_success(persona);
                        transcript.push(ContextEntry::new(persona, round, output.content.clone()));
                        next_round.push(output);
                    }
                    Err(err) => {
                        self.quorum.note_failure(persona, &err.to_string());
                        self.emit_log(
                            LogLevel::Warn,
                            format!("{persona} failed during debate round {round}: {err}"),
                        )
                        .await;
                    }
                }
            }
            previous_round = next_round;

            if let Err(err) = self.quorum.check() {
                return self.fail(err).await;
            }

            self.set_progress(debate_progress(round, self.rounds)).await;
        }

        if self.cancel.is_set() {
            return self.finish_cancelled().await;
        }

        // ── VOTING ───────────────────────────────────────────────
        self.set_phase(Phase::Voting).await;
        self.set_progress(80).await;
        for persona in self.quorum.alive_personas() {
            self.set_unit(persona, UnitState::Voting, None).await;
        }

        let context = render_context(&prompt, &transcript);
        let balloted = {
            let agents = self.alive_agents();
            let context = context.clone();
            let gathered = self
                .gather(join_all(agents.into_iter().map(|agent| {
                    let context = context.clone();
                    async move { (agent.name(), agent.vote(&context).await) }
                })))
                .await;
            match gathered {
                Some(results) => results,
                None => return self.finish_cancelled().await,
            }
        };

        let mut votes: BTreeMap<PersonaName, PersonaVote> = BTreeMap::new();
        for (persona, result) in balloted {
            match result {
                Ok(payload) => {
                    self.quorum.note_success(persona);
                    self.set_unit(persona, UnitState::Voted, Some(payload.vote.to_string()))
                        .await;
                    votes.insert(
                        persona,
                        PersonaVote {
                            vote: payload.vote,
                            reason: payload.reason,
                            conditions: payload.conditions,
                        },
                    );
                }
                Err(err) => {
                    self.quorum.note_failure(persona, &err.to_string());
                    self.emit_log(
                        LogLevel::Warn,
                        format!("{persona} failed during voting: {err}"),
                    )
                    .await;
                }
            }
        }

        if let Err(err) = self.quorum.check() {
            return self.fail(err).await;
        }
        self.set_progress(99).await;

        // ── RESOLVED ─────────────────────────────────────────────
        let tally = VotingTally::from_votes(votes.values().map(|v| &v.vote));
        let decision = tally.decide(self.config.voting_threshold);
        let partial_results = self.quorum.partial_results();
        let summary = Some(render_summary(&tally, partial_results, &self.quorum.excluded_personas()));

        let final_result = FinalResult {
            decision,
            votes: votes.clone(),
            summary: summary.clone(),
            exit_code: decision.exit_code(),
            partial_results,
        };

        self.emit_event(Event::Final {
            decision,
            votes,
            summary,
        })
        .await;
        self.set_phase(Phase::Resolved).await;
        self.set_progress(100).await;
        self.emitter.close();

        EngineOutcome {
            phase: Phase::Resolved,
            final_result: Some(final_result),
        }
    }

    /// Race a gathered phase future against cancellation.
    async fn gather<T>(
        &self,
        gathered: impl std::future::Future<Output = Vec<(PersonaName, MagiResult<T>)>>,
    ) -> Option<Vec<(PersonaName, MagiResult<T>)>> {
        let cancel = self.cancel.clone();
        tokio::select! {
            results = gathered => Some(results),
            () = cancel.cancelled() => None,
        }
    }

    fn alive_agents(&self) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|a| self.quorum.is_alive(a.name()))
            .cloned()
            .collect()
    }

    async fn fail(mut self, err: MagiError) -> EngineOutcome {
        tracing::error!(session_id = %self.session_id, error = %err, "deliberation failed");
        self.emit_event(Event::Error {
            code: err.error_code(),
            message: err.to_string(),
        })
        .await;
        self.set_phase(Phase::Error).await;
        self.emitter.close();
        EngineOutcome {
            phase: Phase::Error,
            final_result: None,
        }
    }

    /// Cancellation is quiet: a CANCELLED phase event, no error, no final.
    async fn finish_cancelled(mut self) -> EngineOutcome {
        tracing::info!(session_id = %self.session_id, "deliberation cancelled");
        self.set_phase(Phase::Cancelled).await;
        self.emitter.close();
        EngineOutcome {
            phase: Phase::Cancelled,
            final_result: None,
        }
    }

    async fn set_phase(&mut self, phase: Phase) {
        self.emit_event(Event::Phase { phase }).await;
    }

    async fn set_progress(&mut self, pct: u8) {
        if pct <= self.last_progress {
            return;
        }
        self.last_progress = pct;
        self.emit_event(Event::Progress { pct }).await;
    }

    async fn set_unit(&mut self, persona: PersonaName, state: UnitState, message: Option<String>) {
        if self.cancel.is_set() {
            return;
        }
        let current = self
            .unit_states
            .get(&persona)
            .copied()
            .unwrap_or(UnitState::Idle);
        // Never regress, and VOTED is final.
        if current == UnitState::Voted || state.rank() < current.rank() {
            return;
        }
        self.unit_states.insert(persona, state);
        self.emit_event(Event::Unit {
            unit: persona,
            state,
            message,
            score: None,
        })
        .await;
    }

    async fn emit_log(&self, level: LogLevel, line: String) {
        if self.cancel.is_set() {
            return;
        }
        self.emit_event(Event::log_line(level, line)).await;
    }

    async fn emit_event(&self, event: Event) {
        let priority = event.priority();
        let envelope = Envelope::new(self.session_id, event);
        if let Err(err) = self.emitter.emit(envelope, priority).await {
            tracing::warn!(session_id = %self.session_id, error = %err, "event emit failed");
        }
    }
}

/// Progress within the DEBATE band [40, 80].
fn debate_progress(round: u32, total_rounds: u32) -> u8 {
    let total = total_rounds.max(1);
    let pct = 40 + (round.min(total) * 40) / total;
    pct.min(80) as u8
}

/// Render the voting context from the prompt and the surviving transcript.
fn render_context(prompt: &str, transcript: &[ContextEntry]) -> String {
    let mut out = format!("Topic under deliberation:\n{prompt}\n");
    for entry in transcript {
        match entry.persona {
            Some(persona) => {
                out.push_str(&format!("\n{} (round {}):\n{}\n", persona, entry.round, entry.content));
            }
            None => {
                out.push_str(&format!("\nEarlier rounds (condensed):\n{}\n", entry.content));
            }
        }
    }
    out
}

fn render_summary(tally: &VotingTally, partial: bool, excluded: &[PersonaName]) -> String {
    let mut summary = format!(
        "tally: {} approve / {} deny / {} conditional",
        tally.approve, tally.deny, tally.conditional
    );
    if partial {
        let names: Vec<String> = excluded.iter().map(|p| p.to_string()).collect();
        summary.push_str(&format!(" (partial result; excluded: {})", names.join(", ")));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debate_progress_banding() {
        assert_eq!(debate_progress(1, 1), 80);
        assert_eq!(debate_progress(1, 2), 60);
        assert_eq!(debate_progress(2, 2), 80);
        assert_eq!(debate_progress(1, 4), 50);
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        flag.set();
        waiter.await.unwrap();
        assert!(flag.is_set());
    }

    #[test]
    fn test_render_context_includes_digest_entries() {
        let transcript = vec![
            ContextEntry::new(PersonaName::Melchior, 1, "position"),
            ContextEntry {
                persona: None,
                round: 0,
                content: "condensed history".to_string(),
            },
        ];
        let context = render_context("topic", &transcript);
        assert!(context.contains("MELCHIOR-1 (round 1)"));
        assert!(context.contains("condensed history"));
    }
}
