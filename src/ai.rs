//! LLM client used to break a roadmap node into tasks.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::prompts::{parse_substeps, substeps_system_prompt, substeps_user_prompt};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI generation is not configured (set OPENAI_API_KEY)")]
    NotConfigured,
    #[error("AI request failed: {0}")]
    Network(String),
    #[error("AI provider returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("AI provider returned no content")]
    EmptyResponse,
    #[error("{0}")]
    Parse(String),
}

pub trait SubstepGenerator: Send + Sync {
    /// Suggests task titles for the node called `node_title`.
    fn generate_substeps(&self, node_title: &str, context: &str) -> Result<Vec<String>, AiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 60,
        }
    }
}

/// Chat-completions client speaking the OpenAI wire format.
pub struct OpenAiClient {
    config: OpenAiConfig,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(mut config: OpenAiConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build();
        Self { config, agent }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    fn complete(&self, system: &str, user: &str) -> Result<String, AiError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
        });

        let response = self
            .agent
            .post(&self.completions_url())
            .set("Authorization", &format!("Bearer {}", self.config.api_key))
            .send_json(body)
            .map_err(|e| match e {
                ureq::Error::Status(status, response) => AiError::Api {
                    status,
                    message: response.into_string().unwrap_or_default(),
                },
                ureq::Error::Transport(t) => AiError::Network(t.to_string()),
            })?;

        let completion: ChatCompletion = response
            .into_json()
            .map_err(|e| AiError::Parse(format!("Malformed completion payload: {e}")))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(AiError::EmptyResponse)
    }
}

impl SubstepGenerator for OpenAiClient {
    fn generate_substeps(&self, node_title: &str, context: &str) -> Result<Vec<String>, AiError> {
        let content = self.complete(
            &substeps_system_prompt(node_title, context),
            &substeps_user_prompt(node_title),
        )?;
        parse_substeps(&content).map_err(|e| {
            tracing::warn!(reply = %content, "unparseable sub-step reply");
            AiError::Parse(e)
        })
    }
}
