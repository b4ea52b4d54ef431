//! Engine configuration with per-persona LLM resolution.
//!
//! All knobs carry serde defaults so a bare `{}` deserializes to a usable
//! configuration. Per-persona overrides are a deep merge of an optional
//! override record onto the global defaults; the merged fields are the
//! enumerated ones below, never dynamic keys.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MagiError, MagiResult};
use crate::persona::PersonaName;
use crate::quorum::VotingThreshold;

/// Deliberation runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global LLM defaults shared by the three personas.
    #[serde(default)]
    pub llm: LlmDefaults,

    /// Rounds in the Debate phase.
    #[serde(default = "default_debate_rounds")]
    pub debate_rounds: u32,

    /// Decision rule applied to the voting tally.
    #[serde(default)]
    pub voting_threshold: VotingThreshold,

    /// Context cap in estimated tokens.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Process-wide LLM call semaphore capacity.
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency_limit: usize,

    /// Streaming emitter behavior.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Guardrail chain behavior.
    #[serde(default)]
    pub guardrails: GuardrailsConfig,

    /// Minimum alive personas for a valid result.
    #[serde(default = "default_quorum_threshold")]
    pub quorum_threshold: usize,

    /// Vote regeneration attempts per persona.
    #[serde(default = "default_schema_retries")]
    pub schema_retry_count: u32,

    /// Prompt template loading.
    #[serde(default)]
    pub templates: TemplateConfig,

    /// Per-persona LLM overrides.
    #[serde(default)]
    pub personas: PersonaOverrides,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmDefaults::default(),
            debate_rounds: default_debate_rounds(),
            voting_threshold: VotingThreshold::default(),
            token_budget: default_token_budget(),
            llm_concurrency_limit: default_llm_concurrency(),
            streaming: StreamingConfig::default(),
            guardrails: GuardrailsConfig::default(),
            quorum_threshold: default_quorum_threshold(),
            schema_retry_count: default_schema_retries(),
            templates: TemplateConfig::default(),
            personas: PersonaOverrides::default(),
        }
    }
}

/// Global LLM defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDefaults {
    /// Default provider credential.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Default model id.
    #[serde(default = "default_model")]
    pub model: String,

    /// Chat-completions endpoint base.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-call timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Retry attempts for transient transport errors.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Sampling temperature in [0,1].
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Completion token ceiling per call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmDefaults {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_llm_timeout(),
            retry_count: default_retry_count(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Streaming emitter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Bounded queue capacity.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Behavior on a full queue.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Backpressure wait in seconds before a non-critical emit fails.
    #[serde(default = "default_emit_timeout")]
    pub emit_timeout_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            overflow_policy: OverflowPolicy::default(),
            emit_timeout_secs: default_emit_timeout(),
        }
    }
}

/// Overflow policy for the streaming emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Evict the oldest non-critical event.
    #[default]
    Drop,
    /// Wait for space, bounded by the emit timeout.
    Backpressure,
}

/// Guardrail chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Whether the chain runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-provider evaluation timeout in seconds.
    #[serde(default = "default_guardrail_timeout")]
    pub timeout_secs: u64,

    /// Policy when a provider times out.
    #[serde(default)]
    pub on_timeout: GuardrailPolicy,

    /// Policy when a provider errors.
    #[serde(default)]
    pub on_error: GuardrailPolicy,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_guardrail_timeout(),
            on_timeout: GuardrailPolicy::default(),
            on_error: GuardrailPolicy::default(),
        }
    }
}

/// What to do when a guardrail provider cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GuardrailPolicy {
    /// Treat as deny and halt.
    #[default]
    FailClosed,
    /// Proceed, leaving a CRITICAL audit log.
    FailOpen,
}

/// Prompt template loading configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Template directory; built-in prompts are used when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Cache TTL in seconds.
    #[serde(default = "default_template_ttl")]
    pub ttl_secs: u64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: default_template_ttl(),
        }
    }
}

/// Optional per-persona override records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonaOverrides {
    #[serde(default)]
    pub melchior: Option<PersonaEntry>,
    #[serde(default)]
    pub balthasar: Option<PersonaEntry>,
    #[serde(default)]
    pub casper: Option<PersonaEntry>,
}

/// Container matching the `personas.<name>.llm` configuration shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonaEntry {
    #[serde(default)]
    pub llm: Option<PersonaLlmConfig>,
}

/// Per-persona override of the global LLM defaults. Unset fields inherit.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonaLlmConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Fully resolved settings for one persona's LLM client.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLlm {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub retry_count: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl EngineConfig {
    /// Resolve the effective LLM settings for a persona: global defaults
    /// with that persona's override record merged on top.
    pub fn resolve_llm(&self, persona: PersonaName) -> ResolvedLlm {
        let entry = match persona {
            PersonaName::Melchior => &self.personas.melchior,
            PersonaName::Balthasar => &self.personas.balthasar,
            PersonaName::Casper => &self.personas.casper,
        };
        let overrides = entry.as_ref().and_then(|e| e.llm.as_ref());

        ResolvedLlm {
            model: overrides
                .and_then(|o| o.model.clone())
                .unwrap_or_else(|| self.llm.model.clone()),
            api_key: overrides
                .and_then(|o| o.api_key.clone())
                .or_else(|| self.llm.api_key.clone()),
            base_url: self.llm.base_url.clone(),
            timeout: Duration::from_secs(
                overrides
                    .and_then(|o| o.timeout_secs)
                    .unwrap_or(self.llm.timeout_secs),
            ),
            retry_count: overrides
                .and_then(|o| o.retry_count)
                .unwrap_or(self.llm.retry_count),
            temperature: overrides
                .and_then(|o| o.temperature)
                .unwrap_or(self.llm.temperature),
            max_tokens: self.llm.max_tokens,
        }
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> MagiResult<()> {
        if self.quorum_threshold == 0 || self.quorum_threshold > PersonaName::ALL.len() {
            return Err(MagiError::Configuration(format!(
                "quorum_threshold must be in 1..=3, got {}",
                self.quorum_threshold
            )));
        }
        if self.token_budget == 0 {
            return Err(MagiError::Configuration("token_budget must be > 0".into()));
        }
        if self.llm_concurrency_limit == 0 {
            return Err(MagiError::Configuration(
                "llm_concurrency_limit must be > 0".into(),
            ));
        }
        if self.debate_rounds == 0 {
            return Err(MagiError::Configuration("debate_rounds must be > 0".into()));
        }
        for persona in PersonaName::ALL {
            let resolved = self.resolve_llm(persona);
            if !(0.0..=1.0).contains(&resolved.temperature) {
                return Err(MagiError::Configuration(format!(
                    "temperature for {persona} must be in [0,1], got {}",
                    resolved.temperature
                )));
            }
        }
        Ok(())
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_retry_count() -> u32 {
    3
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_debate_rounds() -> u32 {
    1
}

fn default_token_budget() -> usize {
    8192
}

fn default_llm_concurrency() -> usize {
    5
}

fn default_queue_size() -> usize {
    100
}

fn default_emit_timeout() -> u64 {
    2
}

fn default_guardrail_timeout() -> u64 {
    3
}

fn default_quorum_threshold() -> usize {
    2
}

fn default_schema_retries() -> u32 {
    3
}

fn default_template_ttl() -> u64 {
    300
}

fn default_true() -> bool {
    true
}
