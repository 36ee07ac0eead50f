//! Prompt templates and prompt assembly

use crate::types::{Message, MetadataExt, RetrievedChunk, Role};

pub const TITLE_PROMPT: &str = "Generate a short title (max 6 words) for a conversation that \
starts with this question. Reply with ONLY the title, nothing else. Question: {question}";

pub const SUMMARIZE_PROMPT: &str = "Summarize the following conversation into a concise summary \
that captures all key topics, questions asked, and answers given. Keep it under 500 words. This \
summary will be used as context for future questions.\n\nConversation:\n{conversation}\n\nSummary:";

pub const CHAT_SYSTEM_PROMPT: &str = "You are an expert knowledge assistant. You hold a natural \
conversation grounded in the provided documents.\n\n\
STRICT RULES:\n\
1. ONLY use facts explicitly stated in the document context below. Never add information from \
your own knowledge.\n\
2. Cite inline with [1], [2] etc. for EVERY substantive claim, choice or recommendation. Place \
citations directly after the relevant statement. This applies to every answer, including \
follow-up questions: as long as you have document context, you cite.\n\
3. If the context does not contain enough information to answer fully, state explicitly what is \
missing.\n\
4. When multiple sources discuss the same topic, synthesize them into one coherent answer; if \
they contradict, present both with their citations.\n\
5. Use Markdown only: ## headers, **bold**, - bullets, numbered lists. NEVER HTML tags.\n\
6. Answer in the same language as the question.\n\n\
End every answer with exactly 3 relevant follow-up questions:\n\
<followup>First follow-up question</followup>\n\
<followup>Second follow-up question</followup>\n\
<followup>Third follow-up question</followup>";

pub const CHAT_PROMPT_TEMPLATE: &str = "DOCUMENT CONTEXT:\n{context}\n\nSOURCES:\n{sources}\n\n\
{history_section}\n\nQUESTION: {question}\n\n\
Answer the question. Match your depth to what is asked — brief for factual questions, thorough \
for analysis or advice. ALWAYS ground claims with [1], [2] citations when you use the document \
context, including on follow-up questions. End with 3 follow-up questions in <followup> tags.";

pub const CHAT_PROMPT_TEMPLATE_WITH_ATTACHMENTS: &str = "ATTACHED DOCUMENTS (uploaded by the \
user):\n{attachment_context}\n\nADDITIONAL KNOWLEDGE BASE CONTEXT:\n{kb_context}\n\n\
SOURCES:\n{sources}\n\n{history_section}\n\nQUESTION: {question}\n\n\
The user attached documents. Answer primarily from those, supplemented by knowledge base \
context. Cite EVERY choice with [1], [2] etc. For factual questions be direct. End with 3 \
follow-up questions in <followup> tags.";

pub const RAG_SYSTEM_PROMPT: &str = "You are an expert knowledge assistant. You answer questions \
accurately based on the provided document context.\n\n\
STRICT RULES:\n\
1. ONLY use facts explicitly stated in the context below. Never add information from your own \
knowledge.\n\
2. Use inline citations like [1], [2] etc. to reference source passages. Place them directly \
after the relevant claim.\n\
3. If the context doesn't contain enough information to fully answer, explicitly state what is \
missing.\n\
4. When multiple sources discuss the same topic, synthesize them into one coherent answer.\n\
5. If sources contradict each other, mention both perspectives with their respective citations.\n\
6. Be thorough and well-structured. Use headers, bullet points, or numbered lists when it \
improves clarity.\n\
7. Answer in the same language as the question.";

pub const RAG_USER_PROMPT_TEMPLATE: &str = "DOCUMENT CONTEXT:\n{context}\n\nSOURCES:\n{sources}\n\n\
QUESTION: {question}\n\n\
Provide a comprehensive, well-structured answer with inline citations [1], [2] etc. Only use \
information from the context above.";

/// Numbered context block plus a deduplicated source list.
///
/// Returns (context, source_lines, next_index); chunk numbering continues
/// from `start_index` so attachment and knowledge-base sections share one
/// citation space.
pub fn build_context(
    chunks: &[RetrievedChunk],
    start_index: usize,
    seen_sources: &mut Vec<String>,
    source_lines: &mut Vec<String>,
) -> (String, usize) {
    let mut parts = Vec::with_capacity(chunks.len());
    let mut index = start_index;
    for chunk in chunks {
        parts.push(format!("[{}] {}", index, chunk.content));
        if !seen_sources.contains(&chunk.source_file) {
            seen_sources.push(chunk.source_file.clone());
            let mut info = Vec::new();
            if let Some(page) = chunk.metadata.page_number() {
                info.push(format!("page {}", page));
            }
            if let Some(section) = chunk.metadata.section_header().filter(|s| !s.is_empty()) {
                info.push(format!("section: {}", section));
            }
            if let Some(language) = chunk.metadata.str_field("language") {
                info.push(format!("lang: {}", language));
            }
            let mut line = format!("- [{}] {}", index, chunk.source_file);
            if !info.is_empty() {
                line.push_str(&format!(" ({})", info.join(", ")));
            }
            source_lines.push(line);
        }
        index += 1;
    }
    (parts.join("\n\n"), index)
}

/// One-shot RAG prompt. Returns (system_prompt, user_prompt).
pub fn build_rag_prompt(question: &str, chunks: &[RetrievedChunk]) -> (String, String) {
    let mut seen_sources = Vec::new();
    let mut source_lines = Vec::new();
    let (context, _) = build_context(chunks, 1, &mut seen_sources, &mut source_lines);

    let user_prompt = RAG_USER_PROMPT_TEMPLATE
        .replace("{context}", &context)
        .replace("{sources}", &source_lines.join("\n"))
        .replace("{question}", question);
    (RAG_SYSTEM_PROMPT.to_string(), user_prompt)
}

/// Role-prefixed transcript for history and summarization prompts.
/// Long assistant replies are truncated to keep history affordable.
pub fn format_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let content = if msg.role == Role::Assistant && msg.content.chars().count() > 800 {
                format!("{}...", crate::types::char_prefix(&msg.content, 800))
            } else {
                msg.content.clone()
            };
            format!("{}: {}", role, content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Search query: the current question plus the last few user messages for
/// topical continuity
pub fn build_search_query(question: &str, recent: &[Message]) -> String {
    if recent.is_empty() {
        return question.to_string();
    }
    let mut user_messages: Vec<&str> = recent
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    user_messages.push(question);
    let skip = user_messages.len().saturating_sub(3);
    user_messages[skip..].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, Scalar};
    use chrono::Utc;

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: "m".into(),
            session_id: "s".into(),
            role,
            content: content.into(),
            sources: vec![],
            created_at: Utc::now(),
        }
    }

    fn chunk(content: &str, source: &str) -> RetrievedChunk {
        RetrievedChunk {
            content: content.into(),
            metadata: Metadata::new(),
            relevance_score: 0.3,
            source_file: source.into(),
        }
    }

    #[test]
    fn test_context_numbering_continues() {
        let attachments = vec![chunk("from the attachment", "intake.pdf")];
        let kb = vec![chunk("from the knowledge base", "guide.pdf")];

        let mut seen = Vec::new();
        let mut sources = Vec::new();
        let (att_ctx, next) = build_context(&attachments, 1, &mut seen, &mut sources);
        let (kb_ctx, _) = build_context(&kb, next, &mut seen, &mut sources);

        assert!(att_ctx.starts_with("[1] "));
        assert!(kb_ctx.starts_with("[2] "));
        assert_eq!(sources.len(), 2);
        assert!(sources[1].starts_with("- [2] guide.pdf"));
    }

    #[test]
    fn test_source_metadata_rendered() {
        let mut metadata = Metadata::new();
        metadata.insert("page_number".into(), Scalar::Int(7));
        metadata.insert("section_header".into(), Scalar::Str("Nutrition".into()));
        let chunks = vec![RetrievedChunk {
            content: "eat protein".into(),
            metadata,
            relevance_score: 0.2,
            source_file: "guide.pdf".into(),
        }];
        let mut seen = Vec::new();
        let mut sources = Vec::new();
        build_context(&chunks, 1, &mut seen, &mut sources);
        assert_eq!(sources[0], "- [1] guide.pdf (page 7, section: Nutrition)");
    }

    #[test]
    fn test_assistant_history_truncated() {
        let long = "y".repeat(1000);
        let text = format_messages(&[message(Role::Assistant, &long)]);
        assert!(text.len() < 900);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn test_search_query_takes_last_three_user_turns() {
        let recent = vec![
            message(Role::User, "one"),
            message(Role::Assistant, "answer"),
            message(Role::User, "two"),
            message(Role::User, "three"),
        ];
        assert_eq!(build_search_query("four", &recent), "two three four");
        assert_eq!(build_search_query("solo", &[]), "solo");
    }
}
