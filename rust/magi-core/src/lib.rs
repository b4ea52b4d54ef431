//! MAGI Core - Three-Agent Deliberation Runtime
//!
//! This crate implements a phased consensus engine over three fixed
//! reasoning personas (MELCHIOR-1, BALTHASAR-2, CASPER-3). Given a prompt,
//! the engine runs the personas in parallel through Thinking, Debate and
//! Voting phases and produces one of APPROVE / DENY / CONDITIONAL.
//!
//! # Architecture
//!
//! The runtime is organized into leaf components wired together by the
//! engine:
//!
//! - [`security`]: prompt sanitization and forbidden-pattern masking
//! - [`guardrails`]: pluggable semantic checks with fail-open/closed policy
//! - [`budget`]: token estimation and context reduction
//! - [`schema`]: structured vote payloads and validation
//! - [`template`]: TTL-cached prompt templates
//! - [`concurrency`]: the process-wide LLM call semaphore
//! - [`llm`]: the chat provider seam and the retrying client
//! - [`emitter`]: bounded event queue with priority classes
//! - [`quorum`]: per-persona standing and the decision rule
//! - [`agent`]: per-persona think/debate/vote operations
//! - [`engine`]: the phase state machine
//!
//! # Example
//!
//! ```rust,ignore
//! use magi_core::engine::{ConsensusEngine, EngineDeps, SessionOptions};
//!
//! let engine = ConsensusEngine::new(session_id, config, &SessionOptions::default(), deps)?;
//! let outcome = engine.run("Should we ship feature X?").await;
//! ```
//!
//! Ownership: an engine exclusively owns its quorum tracker, budget state,
//! agents and emitter for the duration of one session. The
//! [`concurrency::ConcurrencyController`] is the single process-wide shared
//! resource and must be injected explicitly.

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod budget;
pub mod concurrency;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod events;
pub mod guardrails;
pub mod llm;
pub mod persona;
pub mod providers;
pub mod quorum;
pub mod schema;
pub mod security;
pub mod template;

// Re-exports
pub use agent::{Agent, PromptSet};
pub use concurrency::ConcurrencyController;
pub use config::EngineConfig;
pub use emitter::StreamingEmitter;
pub use engine::{CancelFlag, ConsensusEngine, EngineDeps, EngineOutcome, FinalResult, SessionOptions};
pub use error::{MagiError, MagiResult};
pub use events::{Envelope, Event, Phase, UnitState};
pub use persona::{Persona, PersonaManager, PersonaName};
pub use quorum::{QuorumManager, VotingThreshold};
pub use schema::{SchemaValidator, Vote, VotePayload};
