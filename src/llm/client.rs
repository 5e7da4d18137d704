//! OpenAI-compatible vision LLM client.
//!
//! Works with any OpenAI-compatible chat-completions endpoint that accepts
//! image content parts. Images are sent inline as base64 data URLs.

use super::predictor::{Prediction, Predictor, PredictorSource, parse_prediction};
use super::prompts::Prompts;
use crate::config::PredictorConfig;
use crate::error::{EvalError, Result};
use crate::eval::job::JobParameters;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Message role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One part of a multimodal message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Message content: plain text or a list of parts.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// A user message carrying a prompt and an inline image.
    pub fn user_with_image(text: impl Into<String>, image: &[u8]) -> Self {
        let url = format!("data:{};base64,{}", image_mime_type(image), BASE64.encode(image));
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                },
            ]),
        }
    }
}

/// Guess an image's MIME type from its leading bytes.
pub fn image_mime_type(image: &[u8]) -> &'static str {
    match image {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Response from chat completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// OpenAI-compatible LLM client.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: PredictorConfig,
}

impl LlmClient {
    /// Create a new client; requests time out after the configured bound.
    pub fn new(config: PredictorConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    /// The same client, targeting a different model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        let mut config = self.config.clone();
        config.model = model.into();
        Self {
            client: self.client.clone(),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Get the API endpoint URL.
    fn endpoint(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{}/v1/chat/completions", base)
    }

    /// Send a chat completion request and return the first choice's text.
    pub async fn chat(&self, messages: Vec<Message>) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
                return Err(EvalError::PredictorApi(format!(
                    "API error ({}): {}",
                    status, api_error.error.message
                )));
            }
            return Err(EvalError::PredictorApi(format!(
                "Request failed ({}): {}",
                status, body
            )));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| EvalError::MalformedPrediction(format!("invalid completion body: {}", e)))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EvalError::PredictorApi("No choices in response".to_string()))?;

        Ok(choice.message.content.unwrap_or_default())
    }

    /// Test connectivity to the API.
    pub async fn test_connection(&self) -> Result<()> {
        let content = self
            .chat(vec![Message::user("Say 'hello' and nothing else.")])
            .await?;

        if content.to_lowercase().contains("hello") {
            Ok(())
        } else {
            Err(EvalError::PredictorApi(format!(
                "Unexpected response: {}",
                content
            )))
        }
    }
}

#[async_trait]
impl Predictor for LlmClient {
    async fn predict(&self, image: &[u8], question: &str, language: &str) -> Result<Prediction> {
        let prompt = Prompts::evaluation(question, language);
        let reply = self
            .chat(vec![Message::user_with_image(prompt, image)])
            .await?;
        parse_prediction(&reply)
    }
}

/// Each job is evaluated with the model its parameters name.
impl PredictorSource for LlmClient {
    fn predictor_for(&self, params: &JobParameters) -> Result<Arc<dyn Predictor>> {
        Ok(Arc::new(self.with_model(&params.predictor_model)))
    }
}
