//! Chat-completions provider client (OpenAI-compatible wire format)

use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{GroundedError, Result};

/// Token counts reported by the upstream API
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// A completed non-streaming generation
#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Items produced by a token stream
#[derive(Debug)]
pub enum StreamItem {
    Token(String),
    /// Final item: usage from the upstream's last chunk, if it sent one
    Done(Option<TokenUsage>),
    Error(GroundedError),
}

/// One upstream chat-completions endpoint
pub struct ChatProvider {
    pub label: &'static str,
    pub model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

impl ChatProvider {
    pub fn new(
        label: &'static str,
        base_url: impl Into<String>,
        api_key: String,
        model: String,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            label,
            model,
            base_url: base_url.into(),
            api_key,
            client,
        })
    }

    /// Display label "provider (model)"
    pub fn display_label(&self) -> String {
        format!("{} ({})", self.label, self.model)
    }

    fn messages(prompt: &str, system: Option<&str>) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));
        messages
    }

    /// Non-streaming completion
    pub async fn chat(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
    ) -> Result<ChatOutput> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": Self::messages(prompt, system),
                "temperature": temperature,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GroundedError::Provider(format!(
                "{} returned {}: {}",
                self.label, status, body
            )));
        }

        let parsed: CompletionResponse = response.json().await?;
        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                GroundedError::Provider(format!("{} returned no choices", self.label))
            })?;
        Ok(ChatOutput {
            text,
            usage: parsed.usage,
        })
    }

    /// Streaming completion. Returns once the upstream has accepted the
    /// request; tokens arrive on the channel. Dropping the receiver cancels
    /// the forwarding task and aborts the upstream call.
    pub async fn chat_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
    ) -> Result<mpsc::Receiver<StreamItem>> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": Self::messages(prompt, system),
                "temperature": temperature,
                "stream": true,
                "stream_options": {"include_usage": true},
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GroundedError::Provider(format!(
                "{} returned {}: {}",
                self.label, status, body
            )));
        }

        let (tx, rx) = mpsc::channel::<StreamItem>(64);
        let label = self.label;
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut final_usage: Option<TokenUsage> = None;

            'outer: while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(StreamItem::Error(GroundedError::Provider(format!(
                                "{} stream failed: {}",
                                label, e
                            ))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(parsed) => {
                            if parsed.usage.is_some() {
                                final_usage = parsed.usage;
                            }
                            if let Some(token) = parsed
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.clone())
                            {
                                if !token.is_empty()
                                    && tx.send(StreamItem::Token(token)).await.is_err()
                                {
                                    // Receiver dropped: client disconnected
                                    debug!("{} stream receiver dropped, aborting", label);
                                    return;
                                }
                            }
                        }
                        Err(e) => debug!("{} sent unparseable stream chunk: {}", label, e),
                    }
                }
            }

            let _ = tx.send(StreamItem::Done(final_usage)).await;
        });

        Ok(rx)
    }

    /// Zero-cost connectivity probe against the models-list endpoint
    pub async fn probe(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Audio transcription (whisper endpoint). Returns the transcript with
    /// timestamped segments and the audio duration in seconds.
    pub async fn transcribe(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        model: &str,
    ) -> Result<Transcription> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model.to_string())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GroundedError::Provider(format!(
                "{} transcription returned {}: {}",
                self.label, status, body
            )));
        }

        Ok(response.json().await?)
    }
}

/// Whisper transcription result
#[derive(Debug, Clone, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSegment {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub text: String,
}
