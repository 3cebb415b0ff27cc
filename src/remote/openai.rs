//! OpenAI-compatible HTTP client

use super::api::*;
use crate::config::RemoteConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionReply {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ImageBody<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageReply {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

/// Map an unsuccessful HTTP status to the error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let detail = format!("HTTP {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RemoteError::Transient(detail)
    } else if status == StatusCode::BAD_REQUEST {
        RemoteError::BadInput(detail)
    } else {
        RemoteError::Other(detail)
    }
}

fn classify_transport(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() || e.is_connect() {
        RemoteError::Transient(e.to_string())
    } else {
        RemoteError::Other(e.to_string())
    }
}

/// Client for `/chat/completions` and `/images/generations`
pub struct OpenAiClient {
    http: Client,
    api_url: String,
    api_key: Option<SecretString>,
    image_model: String,
    image_size: String,
}

impl OpenAiClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RemoteError::Other(e.to_string()))?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_ref()
                .map(|key| SecretString::new(key.expose_secret().clone())),
            image_model: config.image_model.clone(),
            image_size: config.image_size.clone(),
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.api_url, path);
        let mut req = self.http.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req.send().await.map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status, &error_text));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| RemoteError::Other(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl RemoteCompletionApi for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, RemoteError> {
        debug!(
            "Requesting completion from {} with {} messages",
            request.model,
            request.messages.len()
        );

        let body = ChatCompletionBody {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
        };
        let reply: ChatCompletionReply = self.post("/chat/completions", &body).await?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RemoteError::Other("No choices in response".to_string()))?;

        Ok(CompletionResponse {
            content,
            prompt_tokens: reply.usage.prompt_tokens,
            completion_tokens: reply.usage.completion_tokens,
        })
    }

    async fn generate_image(&self, prompt: &str) -> Result<ImageResponse, RemoteError> {
        debug!("Requesting image from {}", self.image_model);

        let body = ImageBody {
            model: &self.image_model,
            prompt,
            n: 1,
            size: &self.image_size,
        };
        let reply: ImageReply = self.post("/images/generations", &body).await?;

        let image = reply
            .data
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Other("No images in response".to_string()))?;

        Ok(ImageResponse {
            revised_prompt: image.revised_prompt.unwrap_or_else(|| prompt.to_string()),
            url: image.url,
        })
    }
}
