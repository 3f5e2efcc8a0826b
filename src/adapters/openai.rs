//! OpenAI-compatible HTTP client for embeddings and chat generation.
//!
//! Any endpoint speaking the `/embeddings` and streaming `/chat/completions`
//! protocol works; set `openai.base_url` to point elsewhere.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{AdapterError, EmbeddingProvider, GenerationProvider, TokenReceiver};
use crate::config::OpenAiSettings;
use crate::domain::Prompt;

/// Environment variable holding the API key
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Client for an OpenAI-compatible API
pub struct OpenAiClient {
    settings: OpenAiSettings,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed server-sent-events line
#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, AdapterError> {
    let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| AdapterError::Provider(format!("malformed stream chunk: {}", e)))?;
    let content: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();

    Ok(if content.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Token(content)
    })
}

/// Splits a byte stream into SSE lines across chunk boundaries
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and take every complete line
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches('\n')
                    .to_string(),
            );
        }
        lines
    }

    /// The unterminated tail left when the body ends
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).to_string();
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

fn transport_error(operation: &str, e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: 0,
        }
    } else {
        AdapterError::StoreUnavailable(format!("{} request failed: {}", operation, e))
    }
}

async fn check_status(
    operation: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", operation, status, body.trim());
    if status.is_server_error() || status.as_u16() == 429 {
        Err(AdapterError::StoreUnavailable(message))
    } else {
        Err(AdapterError::Provider(message))
    }
}

impl OpenAiClient {
    pub fn new(settings: OpenAiSettings, api_key: impl Into<String>) -> Self {
        Self {
            settings,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from settings, reading the key from `OPENAI_API_KEY`
    pub fn from_env(settings: OpenAiSettings) -> Result<Self, AdapterError> {
        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| AdapterError::Provider(format!("{} is not set", API_KEY_VAR)))?;
        Ok(Self::new(settings, api_key))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    fn name(&self) -> &str {
        &self.settings.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        let response = self
            .client
            .post(self.endpoint("embeddings"))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.settings.embedding_model,
                "input": text,
            }))
            .send()
            .await
            .map_err(|e| transport_error("embedding", e))?;

        let parsed: EmbeddingResponse = check_status("embedding", response)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::Provider(format!("malformed embedding response: {}", e)))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AdapterError::Provider("embedding response had no data".to_string()))
    }
}

#[async_trait]
impl GenerationProvider for OpenAiClient {
    fn name(&self) -> &str {
        &self.settings.chat_model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenReceiver, AdapterError> {
        let user = prompt.user_message();
        let messages = [
            ChatMessage {
                role: "system",
                content: &prompt.system,
            },
            ChatMessage {
                role: "user",
                content: &user,
            },
        ];

        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.settings.chat_model,
                "messages": messages,
                "temperature": self.settings.temperature,
                "max_tokens": self.settings.max_tokens,
                "stream": true,
            }))
            .send()
            .await
            .map_err(|e| transport_error("generation", e))?;
        let mut response = check_status("generation", response).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            loop {
                let (lines, finished) = match response.chunk().await {
                    Ok(Some(chunk)) => (buffer.push(&chunk), false),
                    Ok(None) => (buffer.finish().into_iter().collect(), true),
                    Err(e) => {
                        let _ = tx.send(Err(transport_error("generation stream", e))).await;
                        return;
                    }
                };

                for line in lines {
                    match parse_sse_line(&line) {
                        Ok(SseLine::Token(token)) => {
                            if tx.send(Ok(token)).await.is_err() {
                                debug!("Generation receiver dropped; closing stream");
                                return;
                            }
                        }
                        Ok(SseLine::Done) => return,
                        Ok(SseLine::Skip) => {}
                        Err(e) => {
                            warn!(error = %e, "Bad generation stream chunk");
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }

                if finished {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_lines() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Token("Hel".into()));
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"choices\"").is_empty());
        assert_eq!(
            buffer.push(b":[]}\r\n\ndata: [DO"),
            vec!["data: {\"choices\":[]}\r".to_string(), String::new()]
        );
        assert_eq!(buffer.push(b"NE]\n"), vec!["data: [DONE]".to_string()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_unterminated_last_line_is_kept() {
        let mut buffer = LineBuffer::default();
        let last = r#"data: {"choices":[{"delta":{"content":"bye"}}]}"#;
        assert!(buffer.push(last.as_bytes()).is_empty());

        let tail = buffer.finish().unwrap();
        assert_eq!(parse_sse_line(&tail).unwrap(), SseLine::Token("bye".into()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let settings = OpenAiSettings {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..Default::default()
        };
        let client = OpenAiClient::new(settings, "key");
        assert_eq!(
            client.endpoint("chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }
}
