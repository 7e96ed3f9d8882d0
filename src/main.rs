use std::sync::Arc;

use anyhow::{anyhow, Result};
use assistant_core::{
    browser_tool_registry, AssistantConfig, BookmarkItem, BrowserBackend, BrowsingContext,
    ChatTurnRequest, ConversationStore, HistoryItem, PageCapture, SearchResult, TurnOrchestrator,
};
use assistant_engine::{
    ChatRequest, EngineEvent, EngineRole, EngineStream, InferenceEngine, ToolCallRequest,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_MODEL: &str = "llama3.1";

/// Offline engine: asks for the page once when tools are offered, then
/// answers word by word.
struct DemoEngine;

#[async_trait]
impl InferenceEngine for DemoEngine {
    async fn submit_chat(&self, request: ChatRequest) -> Result<EngineStream> {
        let saw_tool_result = request
            .messages
            .iter()
            .any(|m| m.role == EngineRole::Tool);
        if request.tools.is_some() && !saw_tool_result {
            let calls = vec![ToolCallRequest::new("get_page_content", json!({}))];
            return Ok(stream::iter([
                EngineEvent::Reasoning("The page text will answer this.".into()),
                EngineEvent::ToolCallBatch(calls),
                EngineEvent::Settled,
            ])
            .boxed());
        }

        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == EngineRole::User)
            .map(|m| m.content.clone())
            .ok_or_else(|| anyhow!("request carried no user message"))?;
        let reply = format!(
            "You asked \"{prompt}\" with {} message(s) of history.",
            request.messages.len()
        );
        let mut events: Vec<EngineEvent> = reply
            .split_inclusive(' ')
            .map(|word| EngineEvent::Token(word.to_string()))
            .collect();
        events.push(EngineEvent::Settled);
        Ok(stream::iter(events).boxed())
    }

    fn cancel(&self) {}
}

struct DemoBrowser;

#[async_trait]
impl BrowserBackend for DemoBrowser {
    async fn search_history(&self, query: &str, limit: usize) -> Result<Vec<HistoryItem>> {
        let needle = query.to_lowercase();
        Ok(demo_browsing()
            .history
            .into_iter()
            .filter(|item| item.title.to_lowercase().contains(&needle))
            .take(limit)
            .collect())
    }

    async fn bookmarks(&self, _query: Option<&str>, limit: usize) -> Result<Vec<BookmarkItem>> {
        Ok(demo_browsing().bookmarks.into_iter().take(limit).collect())
    }

    async fn page_content(&self) -> Result<PageCapture> {
        Ok(demo_page())
    }

    async fn screenshot(&self) -> Result<String> {
        Err(anyhow!("no display attached"))
    }

    async fn web_search(&self, _query: &str, _max_results: usize) -> Result<Vec<SearchResult>> {
        Ok(Vec::new())
    }
}

fn demo_page() -> PageCapture {
    PageCapture {
        url: "https://www.rust-lang.org/".into(),
        title: "Rust Programming Language".into(),
        text: Some(
            "A language empowering everyone to build reliable and efficient software.".into(),
        ),
        ..PageCapture::default()
    }
}

fn demo_browsing() -> BrowsingContext {
    BrowsingContext {
        history: vec![HistoryItem {
            title: "The Rust Book".into(),
            url: "https://doc.rust-lang.org/book/".into(),
            visited_at_ms: None,
        }],
        bookmarks: vec![BookmarkItem {
            title: "docs.rs".into(),
            url: "https://docs.rs".into(),
        }],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,assistant_core=debug")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => AssistantConfig::load(&path)?,
        None => AssistantConfig::default(),
    };

    let mut store = ConversationStore::new();
    store.set_current_model(Some(DEMO_MODEL.to_string()));
    store.set_planning_mode(true);
    let store = store.shared();

    let orchestrator = TurnOrchestrator::builder(Arc::new(DemoEngine), store.clone())
        .with_tools(browser_tool_registry(Arc::new(DemoBrowser)))
        .with_config(config)
        .build();

    let request = ChatTurnRequest::new("What is this page about?")
        .with_page_context(demo_page(), demo_browsing());
    let outcome = orchestrator.send_chat_message(request).await?;
    info!(status = ?outcome.status, rounds = outcome.rounds, "turn finished");

    let store = store.lock().await;
    for message in store.messages() {
        println!("[{}] {:?}: {}", message.id, message.role, message.content);
    }
    Ok(())
}
