//! Reqwest-based LLM client for OpenAI-compatible Chat Completions.
//!
//! The pipeline consumes whole completions (code text, summary text), so this
//! client is non-streaming; the request timeout bounds the entire call.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LlmClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let timeout = cfg
            .get("REQUEST_TIMEOUT")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        let api_base_url = cfg.get("API_BASE_URL").unwrap_or_else(|| "default".into());
        let mut base_url = if api_base_url == "default" {
            "https://api.openai.com/v1".to_string()
        } else {
            api_base_url
        };
        let trimmed = base_url.trim_end_matches('/');
        if !trimmed.ends_with("/v1") && !trimmed.contains("/v1/") {
            base_url = format!("{}/v1", trimmed);
        } else {
            base_url = trimmed.to_string();
        }
        let api_key = cfg.get("OPENAI_API_KEY");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        Ok(Self { http, base_url, api_key })
    }

    /// One chat completion, collected to a single string.
    pub async fn complete(&self, messages: Vec<ChatMessage>, opts: &ChatOptions) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let hv = HeaderValue::from_str(&format!("Bearer {}", key))?;
            headers.insert(AUTHORIZATION, hv);
        }

        let body = serde_json::json!({
            "model": opts.model,
            "temperature": opts.temperature,
            "top_p": opts.top_p,
            "messages": messages,
            "max_tokens": opts.max_tokens,
        });

        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .context("failed to send chat request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("LLM error: {}", status);
        }

        let completion: Completion = resp.json().await.context("malformed completion body")?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .unwrap_or_default();
        Ok(text)
    }
}

// Minimal response structures for OpenAI-like completions
#[derive(Debug, Deserialize)]
struct Completion {
    #[allow(dead_code)]
    id: Option<String>,
    #[allow(dead_code)]
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<CompletionMessage>,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}
