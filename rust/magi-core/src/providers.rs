//! Generic chat-completions HTTP adapter.
//!
//! One OpenAI-compatible `POST /v1/chat/completions` realization of
//! [`ChatProvider`]. Vendor-specific protocols stay out of this crate;
//! anything speaking this wire shape (or proxied to it) plugs in here.

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::ResolvedLlm;
use crate::error::{MagiError, MagiResult};
use crate::llm::{ChatProvider, ChatRequest, ChatUsage, LLMResponse};

/// OpenAI-compatible chat completions provider.
#[derive(Debug, Clone)]
pub struct HttpChatProvider {
    settings: ResolvedLlm,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl HttpChatProvider {
    pub fn new(settings: ResolvedLlm) -> MagiResult<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| MagiError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { settings, client })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl ChatProvider for HttpChatProvider {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn complete(&self, request: &ChatRequest) -> MagiResult<LLMResponse> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt }
            ]
        });

        let mut builder = self.client.post(self.api_url()).json(&body);
        if let Some(key) = &self.settings.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                MagiError::LlmTimeout {
                    seconds: self.settings.timeout.as_secs(),
                }
            } else {
                MagiError::Transport(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        let parsed: CompletionBody = response
            .json()
            .await
            .map_err(|e| MagiError::Transport(format!("malformed completion body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| MagiError::Transport("completion carried no content".into()))?;

        let usage = parsed
            .usage
            .map(|u| ChatUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(LLMResponse {
            content,
            usage,
            model: parsed.model.unwrap_or_else(|| self.settings.model.clone()),
        })
    }
}

fn classify_status(status: StatusCode, detail: &str) -> MagiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            MagiError::Auth(format!("{status}: {detail}"))
        }
        StatusCode::TOO_MANY_REQUESTS => MagiError::RateLimited(format!("{status}: {detail}")),
        s if s.is_server_error() => MagiError::Transport(format!("{status}: {detail}")),
        _ => MagiError::Transport(format!("unexpected status {status}: {detail}")),
    }
}
