//! Content generation
//!
//! Jobs created with a prompt (folder-watch `auto_generate`, or
//! `cadence-queue enqueue --prompt`) get their text from a content provider
//! at execution time. The shipped provider talks to any OpenAI-compatible
//! chat completions API; OpenRouter is the default endpoint.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ContentConfig;
use crate::error::ProviderError;
use crate::types::Platform;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Professional,
    Casual,
    #[default]
    Engaging,
    Humorous,
    Informative,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Professional => "professional",
            Tone::Casual => "casual",
            Tone::Engaging => "engaging",
            Tone::Humorous => "humorous",
            Tone::Informative => "informative",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "professional" => Ok(Tone::Professional),
            "casual" => Ok(Tone::Casual),
            "engaging" => Ok(Tone::Engaging),
            "humorous" => Ok(Tone::Humorous),
            "informative" => Ok(Tone::Informative),
            _ => Err(format!(
                "Invalid tone '{}'. Valid options: professional, casual, engaging, humorous, informative",
                s
            )),
        }
    }
}

/// Text generation used by the engine.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Produce a ready-to-publish caption for `prompt`.
    async fn generate(&self, prompt: &str, platform: Platform, tone: Tone) -> ProviderResult<String>;

    /// Suggest up to `count` hashtags (with the leading `#`).
    async fn hashtags(&self, text: &str, count: usize) -> ProviderResult<Vec<String>>;

    /// Rewrite `text`, optionally following `instructions`.
    async fn improve(&self, text: &str, instructions: Option<&str>) -> ProviderResult<String>;
}

/// Target caption length handed to the model; well under the hard limits.
fn suggested_length(platform: Platform) -> usize {
    match platform {
        Platform::Twitter => 280,
        Platform::Facebook => 500,
        Platform::LinkedIn => 700,
        Platform::YouTube => 500,
    }
}

#[derive(Debug, Deserialize)]
struct GeneratedPost {
    #[serde(default)]
    description: String,
    #[serde(default)]
    hashtags: Vec<String>,
    #[serde(default)]
    final_caption: Option<String>,
}

impl GeneratedPost {
    fn caption(self) -> String {
        if let Some(caption) = self.final_caption.filter(|c| !c.trim().is_empty()) {
            return caption.trim().to_string();
        }
        let tags: Vec<&str> = self
            .hashtags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        let suffix = tags.join(" ");
        let description = self.description.trim();
        match (description.is_empty(), suffix.is_empty()) {
            (false, false) => format!("{}\n\n{}", description, suffix),
            (false, true) => description.to_string(),
            _ => suffix,
        }
    }
}

/// Models like to wrap JSON in markdown fences.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Client for OpenAI-compatible chat completion APIs.
pub struct OpenAiCompatibleProvider {
    endpoint: String,
    model: String,
    api_key: SecretString,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatibleProvider {
    /// Build from configuration, reading the API key from
    /// `config.api_key_env`.
    pub fn from_config(config: &ContentConfig) -> ProviderResult<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!("{} is not set", config.api_key_env))
            })?;
        Self::new(config, api_key)
    }

    pub fn new(config: &ContentConfig, api_key: String) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: SecretString::from(api_key),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client,
        })
    }

    async fn chat(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> ProviderResult<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(self.api_key.expose_secret())
            .header("X-Title", "Cadence")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let payload: Value = response.json().await?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing choices[0].message.content".to_string())
            })?;

        if let Some(tokens) = payload["usage"]["total_tokens"].as_u64() {
            tracing::debug!(model = %self.model, tokens, "chat completion");
        }
        Ok(content.to_string())
    }
}

#[async_trait]
impl ContentProvider for OpenAiCompatibleProvider {
    async fn generate(&self, prompt: &str, platform: Platform, tone: Tone) -> ProviderResult<String> {
        let system = "You are an expert social media copywriter. \
            Always respond with STRICT JSON using this schema: \
            {\"title\": \"string\", \"description\": \"string\", \"hashtags\": [\"#tag\"], \
            \"final_caption\": \"string\"}";
        let user = format!(
            "Generate a post with the following constraints:\n\
             Platform: {}\n\
             Tone: {}\n\
             Media context: {}\n\
             Title: <= 80 chars.\n\
             Description: conversational, 2-3 sentences.\n\
             Hashtags: 3-5 platform-appropriate tags as an array.\n\
             final_caption MUST be description + two line breaks + space-separated hashtags, \
             at most {} characters.",
            platform.display_name(),
            tone,
            prompt,
            suggested_length(platform)
        );

        let raw = self
            .chat(system, &user, self.max_tokens, self.temperature)
            .await?;
        let parsed: GeneratedPost = serde_json::from_str(strip_code_fence(&raw))
            .map_err(|e| ProviderError::InvalidResponse(format!("expected JSON caption: {}", e)))?;

        let caption = parsed.caption();
        if caption.is_empty() {
            return Err(ProviderError::InvalidResponse("empty caption".to_string()));
        }
        Ok(caption)
    }

    async fn hashtags(&self, text: &str, count: usize) -> ProviderResult<Vec<String>> {
        let system = format!(
            "Generate {} relevant hashtags for social media. \
             Return ONLY the hashtags, one per line, each starting with #.",
            count
        );
        let raw = self.chat(&system, text, 200, 0.5).await?;

        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('#'))
            .take(count)
            .map(str::to_string)
            .collect())
    }

    async fn improve(&self, text: &str, instructions: Option<&str>) -> ProviderResult<String> {
        let instructions = instructions.unwrap_or(
            "Make it more engaging, clear, and impactful while preserving the core message.",
        );
        let system = format!(
            "You are a content editor. Improve the given text: {}\nReturn ONLY the improved text, nothing else.",
            instructions
        );
        self.chat(&system, text, self.max_tokens, 0.6).await
    }
}

/// Scriptable provider for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MockContentProvider {
    /// Caption returned by `generate`; `None` makes `generate` fail
    pub caption: Option<String>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockContentProvider {
    pub fn returning(caption: &str) -> Self {
        Self {
            caption: Some(caption.to_string()),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl ContentProvider for MockContentProvider {
    async fn generate(&self, prompt: &str, platform: Platform, tone: Tone) -> ProviderResult<String> {
        self.record(format!("generate:{}:{}:{}", platform, tone, prompt));
        self.caption
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse("mock provider failure".to_string()))
    }

    async fn hashtags(&self, text: &str, count: usize) -> ProviderResult<Vec<String>> {
        self.record(format!("hashtags:{}", text));
        Ok((1..=count).map(|i| format!("#tag{}", i)).collect())
    }

    async fn improve(&self, text: &str, _instructions: Option<&str>) -> ProviderResult<String> {
        self.record(format!("improve:{}", text));
        Ok(text.to_string())
    }
}
