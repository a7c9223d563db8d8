use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::llm::{CompletionOptions, LanguageModel};
use crate::ollama::normalize_err_body;

/// Hosted chat-completions provider (OpenAI, OpenRouter, Groq share this wire format).
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            anyhow::bail!("hosted LLM provider requires a non-empty API key");
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build hosted LLM http client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionReq<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResp {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for OpenAiCompatClient {
    async fn complete(&self, prompt: &str, options: CompletionOptions) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&ChatCompletionReq {
                model: &self.model,
                messages: [ChatMessage {
                    role: "user",
                    content: prompt,
                }],
                temperature: options.temperature,
                max_tokens: options.max_tokens,
            })
            .send()
            .await
            .context("failed to call hosted chat completions endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "hosted chat completions returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let body = response
            .json::<ChatCompletionResp>()
            .await
            .context("failed to decode hosted chat completions response")?;

        extract_content(body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn extract_content(body: ChatCompletionResp) -> Result<String> {
    let content = body
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| anyhow::anyhow!("hosted chat completions returned no choices"))?;
    Ok(content.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_rejected() {
        let result = OpenAiCompatClient::new(
            "https://openrouter.ai/api/v1",
            " ",
            "mistral",
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn first_choice_content_is_used() {
        let body: ChatCompletionResp = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"  {\"label\": 1}  "}},{"message":{"content":"x"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(body).unwrap(), r#"{"label": 1}"#);
    }

    #[test]
    fn missing_choices_is_an_error() {
        let body: ChatCompletionResp = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(extract_content(body).is_err());
        let body: ChatCompletionResp =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(extract_content(body).is_err());
    }
}
