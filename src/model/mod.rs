use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::web::models::{Message, Role};

/// In-flight fragment bound; limits how far generation runs ahead of a slow
/// client before the producer suspends.
const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

/// One item on the fragment channel. `Done` and `Error` are terminal; the
/// producer closes the channel after sending either.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Fragment(String),
    Done,
    Error(String),
}

/// The generation capability behind the gateway. One instance is loaded at
/// startup and shared read-only across requests; per-request state is only
/// the conversation passed in.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Completes the conversation and returns the full generated text.
    async fn generate(
        &self,
        history: &[Message],
        last_message: &str,
        max_tokens: usize,
    ) -> Result<String>;

    /// Starts generation and returns a channel of text fragments. Fragments
    /// arrive in production order; dropping the receiver cancels generation.
    async fn generate_stream(
        &self,
        history: &[Message],
        last_message: &str,
        max_tokens: usize,
    ) -> Result<mpsc::Receiver<TokenEvent>>;
}

/// Backend implementation against an OpenAI-compatible chat-completions
/// server (mistral.rs, llama.cpp, vLLM, ...).
pub struct OpenAiBackend {
    base_url: String,
    model_name: String,
    temperature: f32,
    top_p: f32,
    client: Client,
}

impl OpenAiBackend {
    pub fn new(config: &Config) -> Result<Self> {
        info!("Using generation backend at: {}", config.backend_url);

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            model_name: config.model_name.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            client,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn payload(
        &self,
        history: &[Message],
        last_message: &str,
        max_tokens: usize,
        stream: bool,
    ) -> Value {
        let mut messages = history.to_vec();
        messages.push(Message {
            role: Role::User,
            content: last_message.to_string(),
        });
        json!({
            "model": self.model_name,
            "messages": messages,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "max_tokens": max_tokens,
            "stream": stream,
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    async fn generate(
        &self,
        history: &[Message],
        last_message: &str,
        max_tokens: usize,
    ) -> Result<String> {
        info!(
            "Generating response with {} history messages (max_tokens: {})",
            history.len(),
            max_tokens
        );
        debug!("Last message: {}", last_message);

        let payload = self.payload(history, last_message, max_tokens, false);
        let response = self
            .client
            .post(self.completions_url())
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("backend request failed ({}): {}", status, error_text));
        }

        let response_json: Value = response.json().await?;
        debug!("Response JSON: {}", response_json);

        let content = response_json
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| anyhow!("failed to extract content from backend response"))?;

        info!("Response length: {} characters", content.len());
        Ok(content.to_string())
    }

    async fn generate_stream(
        &self,
        history: &[Message],
        last_message: &str,
        max_tokens: usize,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        info!(
            "Streaming response with {} history messages (max_tokens: {})",
            history.len(),
            max_tokens
        );

        let payload = self.payload(history, last_message, max_tokens, true);
        let response = self
            .client
            .post(self.completions_url())
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("backend request failed ({}): {}", status, error_text));
        }

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Backend stream failed: {}", e);
                        let _ = tx.send(TokenEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                for line in drain_lines(&mut buffer, &String::from_utf8_lossy(&chunk)) {
                    match parse_sse_line(&line) {
                        Some(SseEvent::Fragment(text)) => {
                            // A closed channel means the client went away.
                            if tx.send(TokenEvent::Fragment(text)).await.is_err() {
                                info!("Client disconnected, stopping generation");
                                return;
                            }
                        }
                        Some(SseEvent::Done) => {
                            let _ = tx.send(TokenEvent::Done).await;
                            return;
                        }
                        None => {}
                    }
                }
            }
            // Upstream closed without a [DONE] marker; treat as completion.
            let _ = tx.send(TokenEvent::Done).await;
        });

        Ok(rx)
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Fragment(String),
    Done,
}

/// Appends a chunk to the line buffer and drains every complete line,
/// so SSE events split across transport chunks reassemble correctly.
fn drain_lines(buffer: &mut String, chunk: &str) -> Vec<String> {
    buffer.push_str(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim_end_matches('\r').to_string();
        buffer.drain(..=pos);
        lines.push(line);
    }
    lines
}

/// Parses one SSE line from the backend. Returns the delta content of a
/// `data: {...}` chunk, `Done` for `data: [DONE]`, and skips everything else.
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            warn!("Skipping unparsable stream chunk: {}", e);
            return None;
        }
    };
    let content = value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?;
    if content.is_empty() {
        None
    } else {
        Some(SseEvent::Fragment(content.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_line(content: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}",
            serde_json::to_string(content).unwrap()
        )
    }

    #[test]
    fn parses_delta_content() {
        let line = chunk_line("Hello");
        assert_eq!(
            parse_sse_line(&line),
            Some(SseEvent::Fragment("Hello".to_string()))
        );
    }

    #[test]
    fn parses_done_marker() {
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseEvent::Done));
    }

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
    }

    #[test]
    fn skips_chunks_without_content() {
        let line = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}";
        assert_eq!(parse_sse_line(line), None);
    }

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let mut buffer = String::new();
        let full = chunk_line("Hi");
        let (head, tail) = full.split_at(10);

        assert!(drain_lines(&mut buffer, head).is_empty());
        let lines = drain_lines(&mut buffer, &format!("{}\n\ndata: [DONE]\n", tail));
        assert_eq!(lines, vec![full, String::new(), "data: [DONE]".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buffer = String::new();
        let lines = drain_lines(&mut buffer, "data: [DONE]\r\n");
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
    }

    #[tokio::test]
    async fn producer_stops_when_receiver_is_dropped() {
        let (tx, mut rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            let mut sent = 0usize;
            loop {
                if tx.send(TokenEvent::Fragment("x".to_string())).await.is_err() {
                    return sent;
                }
                sent += 1;
            }
        });

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        drop(rx);

        // With the receiver gone the next send fails and the task exits.
        let sent = producer.await.unwrap();
        assert!(sent >= 2);
    }
}
