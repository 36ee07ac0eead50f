//! LLM provider router
//!
//! Ordered provider chain (groq, cerebras, openrouter — each enabled iff its
//! credential is set) with a per-provider circuit breaker. A session's
//! configured primary is tried first; the rest serve as fallback in declared
//! order. Streaming and non-streaming calls share breaker state. Every
//! successful call appends a usage row; usage-logging failures never fail a
//! user request.

mod breaker;
mod provider;

pub use breaker::{CircuitBreaker, COOLDOWN, FAILURE_THRESHOLD};
pub use provider::{
    ChatOutput, ChatProvider, StreamItem, TokenUsage, Transcription, TranscriptionSegment,
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{GroundedError, Result};
use crate::store::{usage, Storage};

const WHISPER_MODEL: &str = "whisper-large-v3-turbo";

/// Rough token estimate used when the upstream omits usage
fn estimate_tokens(chars: usize) -> i64 {
    (chars / 4) as i64
}

struct ProviderSlot {
    provider: ChatProvider,
    breaker: CircuitBreaker,
}

/// A running token stream plus the label of the provider serving it
pub struct StreamedGeneration {
    /// "provider (model)" of the provider that accepted the request
    pub provider_label: String,
    pub tokens: mpsc::Receiver<std::result::Result<String, GroundedError>>,
}

pub struct LlmRouter {
    slots: Vec<ProviderSlot>,
    primary: String,
    storage: Option<Storage>,
}

impl LlmRouter {
    pub fn from_settings(settings: &Settings, storage: Option<Storage>) -> Result<Self> {
        let mut slots = Vec::new();
        if let Some(key) = &settings.groq_api_key {
            slots.push(ProviderSlot {
                provider: ChatProvider::new(
                    "groq",
                    "https://api.groq.com/openai/v1",
                    key.clone(),
                    settings.groq_model.clone(),
                    settings.groq_timeout_secs,
                )?,
                breaker: CircuitBreaker::new(),
            });
        }
        if let Some(key) = &settings.cerebras_api_key {
            slots.push(ProviderSlot {
                provider: ChatProvider::new(
                    "cerebras",
                    "https://api.cerebras.ai/v1",
                    key.clone(),
                    settings.cerebras_model.clone(),
                    settings.cerebras_timeout_secs,
                )?,
                breaker: CircuitBreaker::new(),
            });
        }
        if let Some(key) = &settings.openrouter_api_key {
            slots.push(ProviderSlot {
                provider: ChatProvider::new(
                    "openrouter",
                    "https://openrouter.ai/api/v1",
                    key.clone(),
                    settings.openrouter_model.clone(),
                    settings.openrouter_timeout_secs,
                )?,
                breaker: CircuitBreaker::new(),
            });
        }
        Ok(Self {
            slots,
            primary: settings.llm_provider.clone(),
            storage,
        })
    }

    /// Providers in try order: the configured primary first, the rest in
    /// declared order
    fn ordered(&self) -> Vec<&ProviderSlot> {
        let mut ordered: Vec<&ProviderSlot> = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if slot.provider.label == self.primary {
                ordered.push(slot);
            }
        }
        for slot in &self.slots {
            if slot.provider.label != self.primary {
                ordered.push(slot);
            }
        }
        ordered
    }

    pub fn has_providers(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Display label of the provider that would serve the next call
    pub fn active_provider_label(&self) -> String {
        self.ordered()
            .iter()
            .find(|slot| !slot.breaker.is_open())
            .map(|slot| slot.provider.display_label())
            .unwrap_or_else(|| "none".to_string())
    }

    fn account_chat(&self, provider: &str, model: &str, input: i64, output: i64, total: i64) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = storage
            .with_connection(|conn| usage::log_chat_usage(conn, provider, model, input, output, total));
        if let Err(e) = result {
            debug!("Usage logging failed: {}", e);
        }
    }

    /// Non-streaming generation with failover
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
    ) -> Result<String> {
        let input_chars = prompt.len() + system.map(str::len).unwrap_or(0);

        for slot in self.ordered() {
            if slot.breaker.is_open() {
                debug!("Skipping {}: circuit breaker open", slot.provider.label);
                continue;
            }
            match slot.provider.chat(prompt, system, temperature).await {
                Ok(output) => {
                    slot.breaker.record_success();
                    let usage = output.usage.unwrap_or(TokenUsage {
                        prompt_tokens: estimate_tokens(input_chars),
                        completion_tokens: estimate_tokens(output.text.len()),
                        total_tokens: 0,
                    });
                    self.account_chat(
                        slot.provider.label,
                        &slot.provider.model,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        usage.total_tokens,
                    );
                    return Ok(output.text);
                }
                Err(e) => {
                    slot.breaker.record_failure();
                    warn!("Provider {} failed: {}", slot.provider.label, e);
                }
            }
        }

        Err(GroundedError::ProvidersExhausted(
            "the language model service is temporarily unavailable, please try again later".into(),
        ))
    }

    /// Streaming generation with failover at connect time. Mid-stream
    /// failures terminate the stream; the next request fails over.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
    ) -> Result<StreamedGeneration> {
        let input_chars = prompt.len() + system.map(str::len).unwrap_or(0);

        for slot in self.ordered() {
            if slot.breaker.is_open() {
                debug!("Skipping {}: circuit breaker open", slot.provider.label);
                continue;
            }
            match slot.provider.chat_stream(prompt, system, temperature).await {
                Ok(mut upstream) => {
                    slot.breaker.record_success();
                    let label = slot.provider.label;
                    let model = slot.provider.model.clone();
                    let display = slot.provider.display_label();
                    let storage = self.storage.clone();

                    let (tx, rx) = mpsc::channel(64);
                    tokio::spawn(async move {
                        let mut output_chars = 0usize;
                        let mut reported: Option<TokenUsage> = None;
                        while let Some(item) = upstream.recv().await {
                            match item {
                                StreamItem::Token(token) => {
                                    output_chars += token.len();
                                    if tx.send(Ok(token)).await.is_err() {
                                        // Client went away; drop the upstream
                                        return;
                                    }
                                }
                                StreamItem::Done(usage) => {
                                    reported = usage;
                                    break;
                                }
                                StreamItem::Error(e) => {
                                    let _ = tx.send(Err(e)).await;
                                    return;
                                }
                            }
                        }
                        let usage = reported.unwrap_or(TokenUsage {
                            prompt_tokens: estimate_tokens(input_chars),
                            completion_tokens: estimate_tokens(output_chars),
                            total_tokens: 0,
                        });
                        if let Some(storage) = storage {
                            let result = storage.with_connection(|conn| {
                                usage::log_chat_usage(
                                    conn,
                                    label,
                                    &model,
                                    usage.prompt_tokens,
                                    usage.completion_tokens,
                                    usage.total_tokens,
                                )
                            });
                            if let Err(e) = result {
                                debug!("Usage logging failed: {}", e);
                            }
                        }
                    });

                    return Ok(StreamedGeneration {
                        provider_label: display,
                        tokens: rx,
                    });
                }
                Err(e) => {
                    slot.breaker.record_failure();
                    warn!("Provider {} failed: {}", slot.provider.label, e);
                }
            }
        }

        Err(GroundedError::ProvidersExhausted(
            "the language model service is temporarily unavailable, please try again later".into(),
        ))
    }

    /// Transcribe audio through the primary-capable provider (groq whisper)
    pub async fn transcribe(&self, filename: &str, bytes: Vec<u8>) -> Result<Transcription> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.provider.label == "groq")
            .ok_or_else(|| {
                GroundedError::Provider("Audio transcription requires a groq credential".into())
            })?;

        let transcription = slot.provider.transcribe(filename, bytes, WHISPER_MODEL).await?;
        if let Some(storage) = &self.storage {
            let result = storage.with_connection(|conn| {
                usage::log_whisper_usage(conn, "groq", WHISPER_MODEL, transcription.duration)
            });
            if let Err(e) = result {
                debug!("Usage logging failed: {}", e);
            }
        }
        Ok(transcription)
    }

    /// Probe every configured provider and log the results
    pub async fn probe_all(&self) {
        for slot in &self.slots {
            if slot.provider.probe().await {
                info!("{} ready ({})", slot.provider.label, slot.provider.model);
            } else {
                warn!(
                    "{} API key set but connection failed",
                    slot.provider.label
                );
            }
        }
    }

    /// Per-provider health summary
    pub fn health(&self) -> Vec<serde_json::Value> {
        self.slots
            .iter()
            .map(|slot| {
                serde_json::json!({
                    "name": slot.provider.label,
                    "model": slot.provider.model,
                    "breaker_open": slot.breaker.is_open(),
                    "consecutive_failures": slot.breaker.consecutive_failures(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_keys(primary: &str) -> Settings {
        Settings {
            groq_api_key: Some("gk".into()),
            cerebras_api_key: Some("ck".into()),
            openrouter_api_key: Some("ok".into()),
            llm_provider: primary.to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_provider_order_respects_primary() {
        let router = LlmRouter::from_settings(&settings_with_keys("cerebras"), None).unwrap();
        let labels: Vec<&str> = router.ordered().iter().map(|s| s.provider.label).collect();
        assert_eq!(labels, vec!["cerebras", "groq", "openrouter"]);
    }

    #[test]
    fn test_unconfigured_providers_absent() {
        let settings = Settings {
            groq_api_key: Some("gk".into()),
            ..Settings::default()
        };
        let router = LlmRouter::from_settings(&settings, None).unwrap();
        assert_eq!(router.slots.len(), 1);
        assert!(router.has_providers());
        assert!(router.active_provider_label().starts_with("groq ("));
    }

    #[tokio::test]
    async fn test_exhausted_without_providers() {
        let router = LlmRouter::from_settings(&Settings::default(), None).unwrap();
        let result = router.generate("hi", None, 0.3).await;
        assert!(matches!(result, Err(GroundedError::ProvidersExhausted(_))));
    }
}
