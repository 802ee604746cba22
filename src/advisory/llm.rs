//! # advisory::llm — เรียก Claude / OpenAI / DeepSeek
//!
//! [`LlmClient`] คือ [`DecisionModel`] ตัวจริง: หนึ่ง request → หนึ่ง HTTP call
//! Timeout และ retry อยู่ที่ `AdvisoryEngine` ไม่ใช่ที่นี่

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::advisory::{DecisionModel, DecisionRequest};
use crate::config::{AiConfig, AiProvider};

pub struct LlmClient {
    client: reqwest::Client,
    config: AiConfig,
}

impl LlmClient {
    pub fn new(client: reqwest::Client, config: AiConfig) -> Self {
        Self { client, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl DecisionModel for LlmClient {
    fn name(&self) -> String {
        format!("{} ({})", self.config.provider, self.config.model)
    }

    async fn decide(&self, request: &DecisionRequest) -> anyhow::Result<String> {
        match self.config.provider {
            AiProvider::Claude => self.call_claude(request).await,
            AiProvider::OpenAi | AiProvider::DeepSeek => self.call_chat_completions(request).await,
        }
    }
}

// ─── Anthropic Claude ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ClaudeRequest<'a> {
    model:      &'a str,
    max_tokens: u32,
    system:     &'a str,
    messages:   Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role:    &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Deserialize)]
struct ClaudeContent {
    #[serde(default)]
    text: Option<String>,
}

impl LlmClient {
    async fn call_claude(&self, request: &DecisionRequest) -> anyhow::Result<String> {
        let body = ClaudeRequest {
            model:      &self.config.model,
            max_tokens: self.config.max_tokens,
            system:     &request.system,
            messages:   vec![ChatMessage { role: "user", content: &request.prompt }],
        };

        debug!(symbol = %request.symbol, model = %self.config.model, "Calling Claude API...");

        let resp = self
            .client
            .post(self.endpoint("/v1/messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Claude API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {status}: {text}");
        }

        let data: ClaudeResponse = resp.json().await.context("Claude response parse error")?;

        data.content
            .into_iter()
            .find_map(|c| c.text)
            .context("Claude returned empty content")
    }
}

// ─── OpenAI-compatible (OpenAI / DeepSeek) ────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model:      &'a str,
    max_tokens: u32,
    messages:   Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMsg,
}

#[derive(Deserialize)]
struct ChatChoiceMsg {
    content: Option<String>,
}

impl LlmClient {
    async fn call_chat_completions(&self, request: &DecisionRequest) -> anyhow::Result<String> {
        let provider = self.config.provider;
        let body = ChatRequest {
            model:      &self.config.model,
            max_tokens: self.config.max_tokens,
            messages:   vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user",   content: &request.prompt },
            ],
        };

        debug!(symbol = %request.symbol, model = %self.config.model, "Calling {provider} API...");

        let resp = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{provider} API request failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("{provider} API error {status}: {text}");
        }

        let data: ChatResponse = resp
            .json()
            .await
            .with_context(|| format!("{provider} response parse error"))?;

        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .with_context(|| format!("{provider} returned empty content"))
    }
}
