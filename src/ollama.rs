use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::embedding::Embedder;
use crate::llm::{CompletionOptions, LanguageModel};

const SHRINK_WORD_LIMITS: [usize; 9] = [1400, 1000, 800, 600, 450, 320, 240, 180, 120];

/// Current releases serve `/api/embed`; older ones only `/api/embeddings`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EmbedRoute {
    Embed,
    Embeddings,
}

impl EmbedRoute {
    const ALL: [EmbedRoute; 2] = [EmbedRoute::Embed, EmbedRoute::Embeddings];

    fn path(self) -> &'static str {
        match self {
            EmbedRoute::Embed => "/api/embed",
            EmbedRoute::Embeddings => "/api/embeddings",
        }
    }

    fn body(self, model: &str, text: &str) -> Value {
        match self {
            EmbedRoute::Embed => json!({ "model": model, "input": text }),
            EmbedRoute::Embeddings => json!({ "model": model, "prompt": text }),
        }
    }
}

/// Either response shape: `{"embeddings": [[..]]}` or `{"embedding": [..]}`.
#[derive(Debug, Default, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    embedding: Vec<f32>,
}

impl EmbedResponse {
    fn into_vector(self) -> Option<Vec<f32>> {
        if !self.embedding.is_empty() {
            return Some(self.embedding);
        }
        self.embeddings.into_iter().next().filter(|v| !v.is_empty())
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build ollama http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        // Whole chapters can exceed small embedding contexts; shrink and retry.
        let words = input.split_whitespace().count();
        let mut limits = SHRINK_WORD_LIMITS
            .into_iter()
            .filter(move |limit| *limit < words);
        let mut attempt = input.to_string();
        loop {
            match self.embed_any_route(model, &attempt).await {
                Err(err) if is_context_length_error(&err) => match limits.next() {
                    Some(limit) => {
                        tracing::debug!(model, words, limit, "embedding input too long; shrinking");
                        attempt = first_words(input, limit);
                    }
                    None => {
                        return Err(err.context(format!(
                            "embedding input of {words} words exceeds the model context"
                        )))
                    }
                },
                result => return result,
            }
        }
    }

    async fn embed_any_route(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let mut failures = Vec::new();
        for route in EmbedRoute::ALL {
            match self.embed_via(route, model, text).await {
                Ok(vector) => return Ok(vector),
                Err(err) => failures.push(format!("{err:#}")),
            }
        }
        anyhow::bail!(
            "ollama embedding failed ({}); ensure `ollama pull {model}` has been run",
            failures.join("; ")
        )
    }

    async fn embed_via(&self, route: EmbedRoute, model: &str, text: &str) -> Result<Vec<f32>> {
        let path = route.path();
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&route.body(model, text))
            .send()
            .await
            .with_context(|| format!("failed to call ollama {path}"))?;

        ensure_success(response, path)
            .await?
            .json::<EmbedResponse>()
            .await
            .with_context(|| format!("failed to decode ollama {path} response"))?
            .into_vector()
            .with_context(|| format!("ollama {path} returned no embedding"))
    }

    pub async fn chat(
        &self,
        model: &str,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            model: &'a str,
            messages: [ChatMessage<'a>; 1],
            stream: bool,
            options: ChatOptions,
        }

        #[derive(Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ChatOptions {
            num_predict: usize,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct ChatResp {
            message: ChatRespMessage,
        }

        #[derive(Deserialize)]
        struct ChatRespMessage {
            content: String,
        }

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ChatReq {
                model,
                messages: [ChatMessage {
                    role: "user",
                    content: prompt,
                }],
                stream: false,
                options: ChatOptions {
                    num_predict: options.max_tokens,
                    temperature: options.temperature,
                },
            })
            .send()
            .await
            .context("failed to call ollama chat endpoint")?;

        let response = ensure_success(response, "/api/chat")
            .await?
            .json::<ChatResp>()
            .await
            .context("failed to decode ollama chat response")?;

        Ok(response.message.content.trim().to_string())
    }
}

/// Embedding capability backed by a local Ollama model.
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: OllamaClient,
    model: String,
}

impl OllamaEmbedder {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.client.embed(&self.model, text).await
    }
}

/// Completion capability backed by a local Ollama model.
#[derive(Clone)]
pub struct OllamaJudge {
    client: OllamaClient,
    model: String,
}

impl OllamaJudge {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaJudge {
    async fn complete(&self, prompt: &str, options: CompletionOptions) -> Result<String> {
        self.client.chat(&self.model, prompt, options).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

pub(crate) fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(err) = json
            .get("error")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str())
        {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

async fn ensure_success(response: Response, path: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("ollama {path} returned {status}: {}", normalize_err_body(&body))
}

fn is_context_length_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_ascii_lowercase();
    msg.contains("input length exceeds the context length")
        || (msg.contains("context length") && msg.contains("input length"))
}

fn first_words(text: &str, limit: usize) -> String {
    text.split_whitespace()
        .take(limit)
        .collect::<Vec<_>>()
        .join(" ")
}
