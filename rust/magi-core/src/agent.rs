//! Per-persona deliberation operations.
//!
//! An agent owns one persona and one resolved LLM client. Debate inputs
//! are whatever the engine hands over from the *previous* round; the agent
//! only filters out its own entry, so round isolation is decided upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MagiError, MagiResult};
use crate::llm::{ChatRequest, LLMClient};
use crate::persona::{Persona, PersonaName};
use crate::schema::{SchemaValidator, VotePayload};

/// Output of one thinking pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingOutput {
    pub persona: PersonaName,
    pub content: String,
    pub round: u32,
    pub timestamp: DateTime<Utc>,
}

/// Output of one debate turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateOutput {
    pub persona: PersonaName,
    pub content: String,
    pub round: u32,
    pub timestamp: DateTime<Utc>,
}

/// Prompt bodies for the three operations. `{prompt}`, `{context}` and
/// `{others}` are substituted at call time.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub thinking: String,
    pub debate: String,
    pub vote: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            thinking: "Deliberation topic:\n{prompt}\n\nLay out your position from your \
                       assigned perspective. Be concrete about the evidence and risks you \
                       weigh."
                .to_string(),
            debate: "Deliberation topic:\n{prompt}\n\nPositions from the previous round:\n\
                     {others}\n\nRespond to the other council members. Concede points that \
                     hold, rebut points that do not, and refine your own position."
                .to_string(),
            vote: "Deliberation record:\n{context}\n\nCast your ballot. Reply with a single \
                   JSON object: {\"vote\": \"APPROVE\" | \"DENY\" | \"CONDITIONAL\", \
                   \"reason\": \"<one paragraph>\", \"conditions\": [\"<only for \
                   CONDITIONAL>\"]}. No text outside the JSON object."
                .to_string(),
        }
    }
}

/// One persona's deliberating agent.
#[derive(Debug, Clone)]
pub struct Agent {
    persona: Persona,
    client: LLMClient,
    validator: SchemaValidator,
    prompts: PromptSet,
    schema_retry_count: u32,
}

impl Agent {
    pub fn new(
        persona: Persona,
        client: LLMClient,
        prompts: PromptSet,
        schema_retry_count: u32,
    ) -> Self {
        Self {
            persona,
            client,
            validator: SchemaValidator::new(),
            prompts,
            schema_retry_count,
        }
    }

    pub fn name(&self) -> PersonaName {
        self.persona.name
    }

    /// Per-operation deadline from the resolved settings.
    pub fn timeout(&self) -> std::time::Duration {
        self.client.resolved().timeout
    }

    /// Independent first-pass reasoning over the prompt.
    pub async fn think(&self, prompt: &str) -> MagiResult<ThinkingOutput> {
        let user_prompt = self.prompts.thinking.replace("{prompt}", prompt);
        let response = self.client.send(&self.request(user_prompt)).await?;
        Ok(ThinkingOutput {
            persona: self.persona.name,
            content: response.content,
            round: 0,
            timestamp: Utc::now(),
        })
    }

    /// One debate turn over the previous round's positions.
    pub async fn debate(
        &self,
        prompt: &str,
        previous_round: &[DebateOutput],
        round: u32,
    ) -> MagiResult<DebateOutput> {
        let others = previous_round
            .iter()
            .filter(|o| o.persona != self.persona.name)
            .map(|o| format!("{}:\n{}", o.persona, o.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user_prompt = self
            .prompts
            .debate
            .replace("{prompt}", prompt)
            .replace("{others}", &others);
        let response = self.client.send(&self.request(user_prompt)).await?;
        Ok(DebateOutput {
            persona: self.persona.name,
            content: response.content,
            round,
            timestamp: Utc::now(),
        })
    }

    /// Cast a structured ballot; regenerates on schema failure.
    pub async fn vote(&self, context: &str) -> MagiResult<VotePayload> {
        let base_prompt = self.prompts.vote.replace("{context}", context);
        let mut reasons: Vec<String> = Vec::new();

        for attempt in 0..=self.schema_retry_count {
            let user_prompt = if reasons.is_empty() {
                base_prompt.clone()
            } else {
                // Corrective re-prompt carrying the last failure.
                format!(
                    "{base_prompt}\n\nYour previous reply was rejected: {}. Reply again \
                     with only the JSON object.",
                    reasons[reasons.len() - 1]
                )
            };

            let response = self.client.send(&self.request(user_prompt)).await?;
            match self.validator.validate_vote(&response.content) {
                Ok(payload) => return Ok(payload),
                Err(reason) => {
                    tracing::warn!(
                        persona = %self.persona.name,
                        attempt = attempt + 1,
                        reason = %reason,
                        "vote payload failed schema validation"
                    );
                    reasons.push(reason);
                }
            }
        }

        Err(MagiError::SchemaRetryExceeded {
            attempts: self.schema_retry_count + 1,
            reasons,
        })
    }

    fn request(&self, user_prompt: String) -> ChatRequest {
        let resolved = self.client.resolved();
        ChatRequest {
            system_prompt: self.persona.system_prompt(),
            user_prompt,
            max_tokens: resolved.max_tokens,
            temperature: resolved.temperature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyController;
    use crate::config::ResolvedLlm;
    use crate::llm::{ChatProvider, ChatUsage, LLMResponse};
    use crate::persona::PersonaManager;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    struct ScriptedProvider {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &ChatRequest) -> MagiResult<LLMResponse> {
            self.prompts.lock().push(request.clone());
            let content = self
                .replies
                .lock()
                .pop_front()
                .ok_or_else(|| MagiError::Internal("script exhausted".into()))?;
            Ok(LLMResponse {
                content,
                usage: ChatUsage::default(),
                model: "test".to_string(),
            })
        }
    }

    fn agent_with(provider: Arc<ScriptedProvider>, persona: PersonaName) -> Agent {
        let resolved = ResolvedLlm {
            model: "test".to_string(),
            api_key: None,
            base_url: "http://localhost".to_string(),
            timeout: Duration::from_secs(5),
            retry_count: 0,
            temperature: 0.7,
            max_tokens: 256,
        };
        let client = LLMClient::new(
            provider as Arc<dyn ChatProvider>,
            resolved,
            Arc::new(ConcurrencyController::default()),
        );
        let manager = PersonaManager::new();
        Agent::new(
            manager.get(persona).clone(),
            client,
            PromptSet::default(),
            3,
        )
    }

    #[tokio::test]
    async fn test_think_carries_persona_system_prompt() {
        let provider = ScriptedProvider::new(vec!["analysis"]);
        let agent = agent_with(Arc::clone(&provider), PersonaName::Melchior);

        let output = agent.think("Should we ship?").await.unwrap();
        assert_eq!(output.persona, PersonaName::Melchior);
        assert_eq!(output.content, "analysis");
        assert_eq!(output.round, 0);

        let prompts = provider.prompts.lock();
        assert!(prompts[0].system_prompt.contains("MELCHIOR-1"));
        assert!(prompts[0].user_prompt.contains("Should we ship?"));
    }

    #[tokio::test]
    async fn test_debate_excludes_own_previous_output() {
        let provider = ScriptedProvider::new(vec!["rebuttal"]);
        let agent = agent_with(Arc::clone(&provider), PersonaName::Balthasar);

        let previous = vec![
            DebateOutput {
                persona: PersonaName::Melchior,
                content: "melchior view".to_string(),
                round: 0,
                timestamp: Utc::now(),
            },
            DebateOutput {
                persona: PersonaName::Balthasar,
                content: "own earlier view".to_string(),
                round: 0,
                timestamp: Utc::now(),
            },
        ];

        let output = agent.debate("topic", &previous, 1).await.unwrap();
        assert_eq!(output.round, 1);

        let prompts = provider.prompts.lock();
        assert!(prompts[0].user_prompt.contains("melchior view"));
        assert!(!prompts[0].user_prompt.contains("own earlier view"));
    }

    #[tokio::test]
    async fn test_vote_retries_with_corrective_prompt() {
        let provider = ScriptedProvider::new(vec![
            "not json at all",
            r#"{"vote": "APPROVE", "reason": "sound"}"#,
        ]);
        let agent = agent_with(Arc::clone(&provider), PersonaName::Casper);

        let payload = agent.vote("the record").await.unwrap();
        assert_eq!(payload.reason, "sound");

        let prompts = provider.prompts.lock();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].user_prompt.contains("previous reply was rejected"));
    }

    #[tokio::test]
    async fn test_vote_exhaustion_signals_exclusion() {
        let provider = ScriptedProvider::new(vec!["bad", "bad", "bad", "bad"]);
        let agent = agent_with(provider, PersonaName::Casper);

        let err = agent.vote("the record").await.unwrap_err();
        match err {
            MagiError::SchemaRetryExceeded { attempts, reasons } => {
                assert_eq!(attempts, 4);
                assert_eq!(reasons.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
