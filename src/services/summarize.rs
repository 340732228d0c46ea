// src/services/summarize.rs

//! Summarization client for Gemini `generateContent`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ExternalError, Result};
use crate::models::{RawContent, SummarizationConfig, require_env};
use crate::utils::http::classify_status;

/// Turns extracted page content into a summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, content: &RawContent) -> std::result::Result<String, ExternalError>;
}

/// Google Gemini client.
pub struct GeminiClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    prompt: String,
    timeout: Duration,
    max_input_chars: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GeminiClient {
    /// Build from config; the API key comes from the environment.
    pub fn from_config(client: Client, config: &SummarizationConfig) -> Result<Self> {
        let api_key = require_env(&config.api_key_env)?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            prompt: config.prompt.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            max_input_chars: config.max_input_chars,
        })
    }

    fn build_prompt(&self, content: &RawContent) -> String {
        match &content.title {
            Some(title) => format!("{}\n\nPage title: {}\n\n{}", self.prompt, title, content.markdown),
            None => format!("{}\n\n{}", self.prompt, content.markdown),
        }
    }
}

#[async_trait]
impl Summarizer for GeminiClient {
    async fn summarize(&self, content: &RawContent) -> std::result::Result<String, ExternalError> {
        check_input_size(content, self.max_input_chars)?;

        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": self.build_prompt(content) }] }],
            "generationConfig": { "temperature": 0.2 },
        });

        let response = self
            .client
            .post(format!("{}/models/{}:generateContent", self.endpoint, self.model))
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), format!("generateContent {}", self.model)));
        }

        let text = response.text().await?;
        parse_generate_response(&text)
    }
}

/// Reject inputs the model cannot take before spending a call on them.
pub fn check_input_size(
    content: &RawContent,
    max_input_chars: usize,
) -> std::result::Result<(), ExternalError> {
    let len = content.markdown.chars().count();
    if len > max_input_chars {
        return Err(ExternalError::too_large(format!(
            "content has {len} characters, limit is {max_input_chars}"
        )));
    }
    Ok(())
}

fn parse_generate_response(body: &str) -> std::result::Result<String, ExternalError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| ExternalError::server(format!("unreadable generateContent response: {e}")))?;

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ExternalError::server(format!("prompt blocked: {reason}")));
    }

    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ExternalError::server("model returned an empty summary"));
    }
    Ok(text.trim().to_string())
}
