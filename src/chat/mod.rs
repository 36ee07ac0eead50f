//! Chat orchestration
//!
//! A chat turn: load session + agent, compress history (cached rolling
//! summary), retrieve with attachments prioritized, assemble the grounded
//! prompt, stream tokens with incremental HTML cleanup, persist the turn.

pub mod cleanup;
pub mod prompts;

pub use cleanup::{clean_llm_output, trim_incomplete_tag};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{GroundedError, Result};
use crate::llm::LlmRouter;
use crate::retrieval::{RetrieveOptions, Retriever, SearchScope};
use crate::store::{sessions, Storage};
use crate::types::{Agent, Message, RetrievedChunk, Role, Session, SourceRef};

/// Verbatim messages kept when the older prefix is summarized
const RECENT_KEPT_VERBATIM: usize = 6;

/// Re-summarize only after this many new messages
const SUMMARY_REFRESH_EVERY: i64 = 10;

/// Attachment collection name for a session (prefix of the session id keeps
/// collection names short)
pub fn attachment_collection_name(session_id: &str) -> String {
    format!("chatfiles-{}", crate::types::char_prefix(session_id, 8))
}

/// Events produced by a streaming chat turn, in producer order:
/// status* → sources → status → content* → done (or error)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ChatEvent {
    Status(String),
    Sources(Vec<SourceRef>),
    /// Full cleaned Markdown so far; the client renders the latest one
    Content(String),
    Done(DoneInfo),
    Error { detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DoneInfo {
    pub session_id: String,
    pub message_id: String,
    pub model_used: String,
    pub answer: String,
}

/// Buffered chat result
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub session_id: String,
    pub model_used: String,
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    storage: Storage,
    retriever: Arc<Retriever>,
    llm: Arc<LlmRouter>,
    default_top_k: usize,
    summarize_after_messages: usize,
}

/// Everything a turn needs once session state is loaded
struct TurnContext {
    session: Session,
    agent: Option<Agent>,
    all_messages: Vec<Message>,
    history_section: String,
    search_query: String,
    attachment_collection: Option<String>,
    top_k: usize,
    temperature: f32,
}

impl ChatOrchestrator {
    pub fn new(
        storage: Storage,
        retriever: Arc<Retriever>,
        llm: Arc<LlmRouter>,
        default_top_k: usize,
        summarize_after_messages: usize,
    ) -> Self {
        Self {
            storage,
            retriever,
            llm,
            default_top_k,
            summarize_after_messages,
        }
    }

    pub fn start_session(
        &self,
        collection: Option<&str>,
        agent_id: Option<&str>,
    ) -> Result<Session> {
        if let Some(agent_id) = agent_id {
            let agent = self
                .storage
                .with_connection(|conn| crate::store::agents::get_agent(conn, agent_id))?;
            if agent.is_none() {
                return Err(GroundedError::NotFound(format!("Agent '{}'", agent_id)));
            }
        }
        self.storage
            .with_connection(|conn| sessions::create_session(conn, collection, agent_id))
    }

    async fn load_turn_context(
        &self,
        session_id: &str,
        question: &str,
        top_k: Option<usize>,
        temperature: f32,
    ) -> Result<TurnContext> {
        let session = self
            .storage
            .with_connection(|conn| sessions::get_session(conn, session_id))?
            .ok_or_else(|| GroundedError::NotFound(format!("Session '{}'", session_id)))?;

        let agent = match session.agent_id.as_deref() {
            Some(agent_id) => self
                .storage
                .with_connection(|conn| crate::store::agents::get_agent(conn, agent_id))?,
            None => None,
        };

        let mut top_k = top_k.unwrap_or(self.default_top_k);
        let mut temperature = temperature;
        if let Some(agent) = &agent {
            top_k = agent.top_k;
            temperature = agent.temperature;
        }

        let all_messages = self
            .storage
            .with_connection(|conn| sessions::get_messages(conn, session_id, 200))?;
        let history_section = self.build_history_section(session_id, &all_messages).await;

        let recent = self
            .storage
            .with_connection(|conn| sessions::get_recent_messages(conn, session_id, 6))?;
        let search_query = prompts::build_search_query(question, &recent);

        let attachment_collection = session
            .metadata
            .get("attachment_collection")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(TurnContext {
            session,
            agent,
            all_messages,
            history_section,
            search_query,
            attachment_collection,
            top_k,
            temperature,
        })
    }

    /// Two-pass retrieval when the session has attachments (attachments
    /// first so they get the lower citation indices), one pass otherwise.
    /// Returns (attachment_chunks, kb_chunks).
    async fn retrieve_for_turn(
        &self,
        ctx: &TurnContext,
    ) -> Result<(Vec<RetrievedChunk>, Vec<RetrievedChunk>)> {
        let agent_collections: Vec<String> = ctx
            .agent
            .as_ref()
            .map(|a| a.collections.clone())
            .unwrap_or_default();
        let use_multi_query = ctx.agent.as_ref().map(|a| a.use_multi_query).unwrap_or(false);
        let options = |top_k: usize| RetrieveOptions {
            top_k: Some(top_k),
            use_multi_query,
            use_hybrid: true,
        };

        let kb_scope = if !agent_collections.is_empty() {
            SearchScope::Collections(agent_collections.clone())
        } else if let Some(collection) = &ctx.session.collection {
            SearchScope::Collection(collection.clone())
        } else {
            SearchScope::All
        };

        if let Some(attachment_collection) = &ctx.attachment_collection {
            let att_chunks = self
                .retriever
                .retrieve(
                    &ctx.search_query,
                    &SearchScope::Collection(attachment_collection.clone()),
                    &options((ctx.top_k * 2).min(30)),
                )
                .await?;
            let kb_chunks = self
                .retriever
                .retrieve(&ctx.search_query, &kb_scope, &options(ctx.top_k))
                .await?;
            Ok((att_chunks, kb_chunks))
        } else {
            let mut kb_chunks = self
                .retriever
                .retrieve(&ctx.search_query, &kb_scope, &options(ctx.top_k))
                .await?;
            // Agent scoped to collections that yield nothing: fall back to a
            // global search rather than answering blind
            if kb_chunks.is_empty() && !agent_collections.is_empty() {
                kb_chunks = self
                    .retriever
                    .retrieve(&ctx.search_query, &SearchScope::All, &options(ctx.top_k))
                    .await?;
            }
            Ok((Vec::new(), kb_chunks))
        }
    }

    fn assemble_prompt(
        ctx: &TurnContext,
        question: &str,
        att_chunks: &[RetrievedChunk],
        kb_chunks: &[RetrievedChunk],
    ) -> (String, String) {
        let mut seen_sources = Vec::new();
        let mut source_lines = Vec::new();

        let user_prompt = if !att_chunks.is_empty() {
            let (att_context, next) =
                prompts::build_context(att_chunks, 1, &mut seen_sources, &mut source_lines);
            let (kb_context, _) =
                prompts::build_context(kb_chunks, next, &mut seen_sources, &mut source_lines);
            prompts::CHAT_PROMPT_TEMPLATE_WITH_ATTACHMENTS
                .replace(
                    "{attachment_context}",
                    if att_context.is_empty() {
                        "(no passages from attachments)"
                    } else {
                        att_context.as_str()
                    },
                )
                .replace(
                    "{kb_context}",
                    if kb_context.is_empty() {
                        "(no additional context)"
                    } else {
                        kb_context.as_str()
                    },
                )
                .replace(
                    "{sources}",
                    if source_lines.is_empty() {
                        "(no sources)".to_string()
                    } else {
                        source_lines.join("\n")
                    }
                    .as_str(),
                )
                .replace("{history_section}", &ctx.history_section)
                .replace("{question}", question)
        } else {
            let (context, _) =
                prompts::build_context(kb_chunks, 1, &mut seen_sources, &mut source_lines);
            prompts::CHAT_PROMPT_TEMPLATE
                .replace(
                    "{context}",
                    if context.is_empty() {
                        "(no documents found)"
                    } else {
                        context.as_str()
                    },
                )
                .replace(
                    "{sources}",
                    if source_lines.is_empty() {
                        "(no sources)".to_string()
                    } else {
                        source_lines.join("\n")
                    }
                    .as_str(),
                )
                .replace("{history_section}", &ctx.history_section)
                .replace("{question}", question)
        };

        let system_prompt = ctx
            .agent
            .as_ref()
            .map(|a| a.system_prompt.clone())
            .unwrap_or_else(|| prompts::CHAT_SYSTEM_PROMPT.to_string());
        (system_prompt, user_prompt)
    }

    fn result_status(
        att_chunks: &[RetrievedChunk],
        kb_chunks: &[RetrievedChunk],
        sources: &[SourceRef],
    ) -> String {
        let total = att_chunks.len() + kb_chunks.len();
        if total == 0 {
            return "No relevant documents found — answering from general knowledge".to_string();
        }
        let distinct: std::collections::HashSet<&str> =
            sources.iter().map(|s| s.filename.as_str()).collect();
        if !att_chunks.is_empty() {
            return format!(
                "{} passages from attachments + {} from the knowledge base",
                att_chunks.len(),
                kb_chunks.len()
            );
        }
        let avg_score: f32 =
            sources.iter().map(|s| s.relevance_score).sum::<f32>() / sources.len() as f32;
        if avg_score < 0.4 {
            format!(
                "{} passages found (low relevance) in {} document(s)",
                total,
                distinct.len()
            )
        } else {
            format!("{} passages found in {} document(s)", total, distinct.len())
        }
    }

    fn persist_turn(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        sources: &[SourceRef],
    ) -> Result<Message> {
        self.storage.with_transaction(|conn| {
            sessions::add_message(conn, session_id, Role::User, question, &[])?;
            sessions::add_message(conn, session_id, Role::Assistant, answer, sources)
        })
    }

    /// Buffered chat turn
    pub async fn chat(
        &self,
        session_id: &str,
        question: &str,
        top_k: Option<usize>,
        temperature: f32,
    ) -> Result<ChatResponse> {
        let ctx = self
            .load_turn_context(session_id, question, top_k, temperature)
            .await?;

        let (att_chunks, kb_chunks) = self.retrieve_for_turn(&ctx).await?;
        let sources: Vec<SourceRef> = att_chunks
            .iter()
            .chain(kb_chunks.iter())
            .map(SourceRef::from_chunk)
            .collect();

        let (system_prompt, user_prompt) =
            Self::assemble_prompt(&ctx, question, &att_chunks, &kb_chunks);
        let raw = self
            .llm
            .generate(&user_prompt, Some(&system_prompt), ctx.temperature)
            .await?;
        let answer = clean_llm_output(&raw);

        self.persist_turn(session_id, question, &answer, &sources)?;
        if ctx.all_messages.is_empty() {
            self.auto_title(session_id, question).await;
        }

        Ok(ChatResponse {
            answer,
            sources,
            session_id: session_id.to_string(),
            model_used: self.llm.active_provider_label(),
        })
    }

    /// Streaming chat turn. Session validation errors surface before the
    /// stream starts; later failures arrive as `ChatEvent::Error`.
    pub async fn chat_stream(
        &self,
        session_id: &str,
        question: &str,
        top_k: Option<usize>,
        temperature: f32,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        // Fail fast on unknown sessions so the route can return 404
        self.storage
            .with_connection(|conn| sessions::get_session(conn, session_id))?
            .ok_or_else(|| GroundedError::NotFound(format!("Session '{}'", session_id)))?;

        let (tx, rx) = mpsc::channel(64);
        let orchestrator = self.clone();
        let session_id = session_id.to_string();
        let question = question.to_string();

        tokio::spawn(async move {
            if let Err(e) = orchestrator
                .run_stream(&session_id, &question, top_k, temperature, &tx)
                .await
            {
                tracing::error!("Chat streaming failed: {}", e);
                let _ = tx
                    .send(ChatEvent::Error {
                        detail: e.public_message(),
                    })
                    .await;
            }
        });

        Ok(rx)
    }

    async fn run_stream(
        &self,
        session_id: &str,
        question: &str,
        top_k: Option<usize>,
        temperature: f32,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let ctx = self
            .load_turn_context(session_id, question, top_k, temperature)
            .await?;

        let _ = tx
            .send(ChatEvent::Status("Searching documents...".to_string()))
            .await;

        let (att_chunks, kb_chunks) = self.retrieve_for_turn(&ctx).await?;
        let sources: Vec<SourceRef> = att_chunks
            .iter()
            .chain(kb_chunks.iter())
            .map(SourceRef::from_chunk)
            .collect();

        let _ = tx
            .send(ChatEvent::Status(Self::result_status(
                &att_chunks,
                &kb_chunks,
                &sources,
            )))
            .await;
        let _ = tx.send(ChatEvent::Sources(sources.clone())).await;
        let _ = tx
            .send(ChatEvent::Status("Generating answer...".to_string()))
            .await;

        let (system_prompt, user_prompt) =
            Self::assemble_prompt(&ctx, question, &att_chunks, &kb_chunks);
        let mut generation = self
            .llm
            .generate_stream(&user_prompt, Some(&system_prompt), ctx.temperature)
            .await?;

        let mut full_answer = String::new();
        let mut prev_clean = String::new();
        let mut token_count = 0usize;

        while let Some(item) = generation.tokens.recv().await {
            let token = item?;
            full_answer.push_str(&token);
            token_count += 1;

            let at_boundary = token.ends_with('\n')
                || token.ends_with('.')
                || token.ends_with('!')
                || token.ends_with('?');
            if token_count % 3 == 0 || at_boundary {
                let trimmed = trim_incomplete_tag(&full_answer);
                let clean = clean_llm_output(trimmed);
                if clean != prev_clean {
                    if tx.send(ChatEvent::Content(clean.clone())).await.is_err() {
                        // Client disconnected mid-stream: abandon the turn
                        return Ok(());
                    }
                    prev_clean = clean;
                }
            }
        }

        let answer = clean_llm_output(&full_answer);

        let assistant_message = self.persist_turn(session_id, question, &answer, &sources)?;
        if ctx.all_messages.is_empty() {
            self.auto_title(session_id, question).await;
        }

        let _ = tx
            .send(ChatEvent::Done(DoneInfo {
                session_id: session_id.to_string(),
                message_id: assistant_message.id,
                model_used: generation.provider_label.clone(),
                answer,
            }))
            .await;
        Ok(())
    }

    /// History section: everything verbatim for short conversations, a
    /// cached summary plus the recent tail for long ones.
    async fn build_history_section(&self, session_id: &str, messages: &[Message]) -> String {
        if messages.is_empty() {
            return "CONVERSATION: (first question in this conversation)".to_string();
        }
        let total = messages.len();
        if total <= self.summarize_after_messages {
            return format!(
                "CONVERSATION HISTORY:\n{}",
                prompts::format_messages(messages)
            );
        }

        let split_point = total - RECENT_KEPT_VERBATIM;
        let older = &messages[..split_point];
        let recent = &messages[split_point..];

        // The summary is cached in session metadata; regenerate only every
        // SUMMARY_REFRESH_EVERY new messages to keep token cost flat
        let meta = self
            .storage
            .with_connection(|conn| sessions::get_session_metadata(conn, session_id))
            .unwrap_or_else(|_| serde_json::json!({}));
        let cached_summary = meta
            .get("summary")
            .and_then(|v| v.as_str())
            .map(String::from);
        let summary_at_count = meta
            .get("summary_at_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let summary = match cached_summary {
            Some(summary) if (total as i64 - summary_at_count) < SUMMARY_REFRESH_EVERY => summary,
            _ => {
                let summary = self.summarize_conversation(older).await;
                let update = self.storage.with_connection(|conn| {
                    sessions::update_session_metadata(
                        conn,
                        session_id,
                        serde_json::json!({
                            "summary": summary,
                            "summary_at_count": total,
                        }),
                    )
                });
                if let Err(e) = update {
                    warn!("Failed to cache conversation summary: {}", e);
                }
                summary
            }
        };

        format!(
            "CONVERSATION SUMMARY (earlier in this chat):\n{}\n\nRECENT MESSAGES:\n{}",
            summary,
            prompts::format_messages(recent)
        )
    }

    async fn summarize_conversation(&self, messages: &[Message]) -> String {
        let conversation = prompts::format_messages(messages);
        let prompt = prompts::SUMMARIZE_PROMPT.replace("{conversation}", &conversation);
        match self.llm.generate(&prompt, None, 0.3).await {
            Ok(summary) => summary.trim().to_string(),
            Err(e) => {
                warn!("Summarization failed: {}", e);
                // Degrade to a plain list of recent user questions
                let user_messages: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == Role::User)
                    .take(5)
                    .map(|m| m.content.as_str())
                    .collect();
                format!("Topics discussed: {}", user_messages.join("; "))
            }
        }
    }

    /// Generate and store a short session title from the first question
    async fn auto_title(&self, session_id: &str, question: &str) {
        let prompt = prompts::TITLE_PROMPT.replace("{question}", question);
        match self.llm.generate(&prompt, None, 0.3).await {
            Ok(raw) => {
                let title: String = raw
                    .trim()
                    .trim_matches(|c| c == '"' || c == '\'')
                    .chars()
                    .take(60)
                    .collect();
                if !title.is_empty() {
                    let update = self.storage.with_connection(|conn| {
                        sessions::update_session_title(conn, session_id, &title)
                    });
                    if let Err(e) = update {
                        warn!("Failed to store session title: {}", e);
                    }
                }
            }
            Err(e) => warn!("Failed to auto-generate title: {}", e),
        }
    }
}
