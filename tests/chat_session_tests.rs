//! Chat orchestration tests: session memory, summary caching, event order
//!
//! Run with: cargo test --test chat_session_tests

mod common;

use std::sync::Arc;

use grounded::chat::{ChatEvent, ChatOrchestrator};
use grounded::config::Settings;
use grounded::llm::LlmRouter;
use grounded::retrieval::Retriever;
use grounded::store::{sessions, Storage};
use grounded::types::Role;

use common::{in_memory_vectors, StubEmbedder};

/// Orchestrator wired to in-memory stores and a router with no credentials:
/// retrieval works, LLM calls fail over to their degraded paths.
fn orchestrator(storage: &Storage) -> ChatOrchestrator {
    let vectors = in_memory_vectors();
    vectors.get_or_create_collection("kb").unwrap();
    let router = Arc::new(LlmRouter::from_settings(&Settings::default(), None).unwrap());
    let retriever = Arc::new(Retriever::new(
        vectors,
        Arc::new(StubEmbedder),
        router.clone(),
        None,
        15,
        30,
        0.65,
    ));
    ChatOrchestrator::new(storage.clone(), retriever, router, 15, 20)
}

fn seed_messages(storage: &Storage, session_id: &str, turns: usize) {
    storage
        .with_connection(|conn| {
            for i in 0..turns {
                sessions::add_message(
                    conn,
                    session_id,
                    if i % 2 == 0 { Role::User } else { Role::Assistant },
                    &format!("message number {} about training topics", i),
                    &[],
                )?;
            }
            Ok(())
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn summary_cached_with_message_count() {
    let storage = Storage::open_in_memory().unwrap();
    let orchestrator = orchestrator(&storage);
    let session = orchestrator.start_session(Some("kb"), None).unwrap();
    seed_messages(&storage, &session.id, 25);

    // The turn itself fails (no providers), but history compression runs
    // first and caches the degraded summary
    let result = orchestrator.chat(&session.id, "next question", None, 0.3).await;
    assert!(result.is_err());

    let meta = storage
        .with_connection(|conn| sessions::get_session_metadata(conn, &session.id))
        .unwrap();
    let summary = meta["summary"].as_str().unwrap();
    assert!(summary.starts_with("Topics discussed:"));
    assert_eq!(meta["summary_at_count"], 25);

    // Five more messages: under the refresh interval, the cache is reused
    seed_messages(&storage, &session.id, 5);
    let _ = orchestrator.chat(&session.id, "another question", None, 0.3).await;
    let meta = storage
        .with_connection(|conn| sessions::get_session_metadata(conn, &session.id))
        .unwrap();
    assert_eq!(meta["summary_at_count"], 25);

    // Ten past the cached count: the summary is regenerated
    seed_messages(&storage, &session.id, 5);
    let _ = orchestrator.chat(&session.id, "yet another", None, 0.3).await;
    let meta = storage
        .with_connection(|conn| sessions::get_session_metadata(conn, &session.id))
        .unwrap();
    assert_eq!(meta["summary_at_count"], 35);
}

#[tokio::test(flavor = "multi_thread")]
async fn short_conversations_have_no_summary() {
    let storage = Storage::open_in_memory().unwrap();
    let orchestrator = orchestrator(&storage);
    let session = orchestrator.start_session(Some("kb"), None).unwrap();
    seed_messages(&storage, &session.id, 10);

    let _ = orchestrator.chat(&session.id, "question", None, 0.3).await;
    let meta = storage
        .with_connection(|conn| sessions::get_session_metadata(conn, &session.id))
        .unwrap();
    assert!(meta.get("summary").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_events_arrive_in_order_and_terminate_with_error() {
    let storage = Storage::open_in_memory().unwrap();
    let orchestrator = orchestrator(&storage);
    let session = orchestrator.start_session(Some("kb"), None).unwrap();

    let mut rx = orchestrator
        .chat_stream(&session.id, "what is in the knowledge base?", None, 0.3)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    // status* → sources → status → error (no providers configured)
    assert!(matches!(events[0], ChatEvent::Status(_)));
    let sources_pos = events
        .iter()
        .position(|e| matches!(e, ChatEvent::Sources(_)))
        .expect("sources event present");
    let error_pos = events
        .iter()
        .position(|e| matches!(e, ChatEvent::Error { .. }))
        .expect("error event terminates the stream");
    assert!(sources_pos < error_pos);
    assert_eq!(error_pos, events.len() - 1);
    // No content events once the provider chain is exhausted
    assert!(!events.iter().any(|e| matches!(e, ChatEvent::Content(_))));
    // The failed turn is not persisted
    let session = storage
        .with_connection(|conn| sessions::get_session(conn, &session.id))
        .unwrap()
        .unwrap();
    assert_eq!(session.message_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_session_fails_before_streaming() {
    let storage = Storage::open_in_memory().unwrap();
    let orchestrator = orchestrator(&storage);
    let result = orchestrator.chat_stream("missing", "question", None, 0.3).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_agent_rejected_at_session_start() {
    let storage = Storage::open_in_memory().unwrap();
    let orchestrator = orchestrator(&storage);
    assert!(orchestrator.start_session(None, Some("no-such-agent")).is_err());
}
