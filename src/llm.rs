// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! HTTP client for the external vision model

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::analysis::{EncodedImage, TargetRecognizer};
use crate::config::{EngineConfig, Provider};
use crate::{DeepTrackError, Result};

/// Vision model client speaking either the OpenAI chat protocol or Ollama's
pub struct VisionClient {
    client: Client,
    provider: Provider,
    base_url: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
}

// OpenAI-compatible chat completions

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

// Ollama

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    system: String,
    prompt: String,
    stream: bool,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    name: String,
}

impl VisionClient {
    /// Create a new client from the engine settings
    pub fn new(engine: &EngineConfig, system_prompt: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(engine.timeout_secs))
            .build()?;

        // Normalize URL
        let base_url = engine
            .url
            .trim_end_matches('/')
            .trim_end_matches("/api/generate")
            .trim_end_matches("/chat/completions")
            .to_string();

        Ok(Self {
            client,
            provider: engine.provider,
            base_url,
            model: engine.model.clone(),
            api_key: engine.api_key.clone(),
            system_prompt: system_prompt.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn models_url(&self) -> String {
        match self.provider {
            Provider::OpenAi => format!("{}/models", self.base_url),
            Provider::Ollama => format!("{}/api/tags", self.base_url),
        }
    }

    /// Check if the service answers at all
    pub async fn health_check(&self) -> Result<()> {
        self.authorized(self.client.get(self.models_url()))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                DeepTrackError::ModelUnavailable(format!(
                    "Cannot connect to recognition service at {}: {}",
                    self.base_url, e
                ))
            })?;

        Ok(())
    }

    /// List available models
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .authorized(self.client.get(self.models_url()))
            .send()
            .await?
            .error_for_status()?;

        let models = match self.provider {
            Provider::OpenAi => {
                let list: ModelList = response.json().await?;
                list.data.into_iter().map(|m| m.id).collect()
            }
            Provider::Ollama => {
                let tags: TagsResponse = response.json().await?;
                tags.models.into_iter().map(|m| m.name).collect()
            }
        };
        Ok(models)
    }

    async fn chat_with_image(&self, prompt: &str, image: &EncodedImage) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let data_url = format!("data:{};base64,{}", image.mime_type, image.base64);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: vec![ContentPart::Text { text: self.system_prompt.clone() }],
                },
                ChatMessage {
                    role: "user",
                    content: vec![
                        ContentPart::Text { text: prompt.to_string() },
                        ContentPart::ImageUrl { image_url: ImageUrl { url: data_url } },
                    ],
                },
            ],
        };

        debug!("Sending vision request: model={}", self.model);

        let response = self.authorized(self.client.post(&url)).json(&request).send().await?;

        if !response.status().is_success() {
            return Err(DeepTrackError::ModelUnavailable(format!(
                "Recognition service returned status {}",
                response.status()
            )));
        }

        let result: ChatResponse = response.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| DeepTrackError::ModelUnavailable("Empty reply from recognition service".to_string()))
    }

    async fn generate_with_image(&self, prompt: &str, image: &EncodedImage) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            system: self.system_prompt.clone(),
            prompt: prompt.to_string(),
            stream: false,
            images: vec![image.base64.clone()],
        };

        debug!("Sending vision request to Ollama: model={}", self.model);

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            return Err(DeepTrackError::ModelUnavailable(format!(
                "Ollama returned status {}",
                response.status()
            )));
        }

        let result: GenerateResponse = response.json().await?;
        Ok(result.response)
    }
}

#[async_trait]
impl TargetRecognizer for VisionClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn recognize(&self, prompt: &str, image: &EncodedImage) -> Result<String> {
        match self.provider {
            Provider::OpenAi => self.chat_with_image(prompt, image).await,
            Provider::Ollama => self.generate_with_image(prompt, image).await,
        }
    }
}
