use std::sync::Arc;

use assistant_engine::{
    BrowserTool, ParameterKind, ToolDefinition, ToolError, ToolParameter, ToolRegistry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::{BookmarkItem, HistoryItem, PageCapture};

pub const SEARCH_HISTORY_TOOL: &str = "search_history";
pub const GET_BOOKMARKS_TOOL: &str = "get_bookmarks";
pub const GET_PAGE_CONTENT_TOOL: &str = "get_page_content";
pub const TAKE_SCREENSHOT_TOOL: &str = "take_screenshot";
pub const WEB_SEARCH_TOOL: &str = "web_search";

const DEFAULT_RESULT_LIMIT: usize = 10;
const MAX_RESULT_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Browser-side data sources the assistant's tools read from. Implemented by
/// the host application.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn search_history(
        &self,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryItem>>;
    async fn bookmarks(
        &self,
        query: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<BookmarkItem>>;
    async fn page_content(&self) -> anyhow::Result<PageCapture>;
    /// Returns a base64 image or data URL of the visible tab.
    async fn screenshot(&self) -> anyhow::Result<String>;
    async fn web_search(
        &self,
        query: &str,
        max_results: usize,
    ) -> anyhow::Result<Vec<SearchResult>>;
}

/// Registry holding every browser tool, backed by `backend`.
pub fn browser_tool_registry(backend: Arc<dyn BrowserBackend>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SearchHistoryTool::new(backend.clone())));
    registry.register(Arc::new(BookmarksTool::new(backend.clone())));
    registry.register(Arc::new(PageContentTool::new(backend.clone())));
    registry.register(Arc::new(ScreenshotTool::new(backend.clone())));
    registry.register(Arc::new(WebSearchTool::new(backend)));
    registry
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, ToolError> {
    // Engines send `null` for argument-less calls.
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(invalid_arguments)
}

fn invalid_arguments(err: serde_json::Error) -> ToolError {
    ToolError::InvalidInput(format!("invalid arguments: {err}"))
}

fn backend_error(err: anyhow::Error) -> ToolError {
    ToolError::Invocation(format!("{err:#}"))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_RESULT_LIMIT)
        .clamp(1, MAX_RESULT_LIMIT)
}

fn limit_parameter(description: &str) -> ToolParameter {
    ToolParameter::new("limit", ParameterKind::Number, description)
}

pub struct SearchHistoryTool {
    definition: ToolDefinition,
    backend: Arc<dyn BrowserBackend>,
}

impl SearchHistoryTool {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        let definition = ToolDefinition::new(
            SEARCH_HISTORY_TOOL,
            "Search the user's browsing history by keyword.",
        )
        .with_parameter(
            ToolParameter::new("query", ParameterKind::String, "Keywords to look for").required(),
        )
        .with_parameter(limit_parameter("Maximum number of entries to return"));
        Self {
            definition,
            backend,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchHistoryArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl BrowserTool for SearchHistoryTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let params: SearchHistoryArgs = parse_args(args)?;
        if params.query.trim().is_empty() {
            return Err(ToolError::InvalidInput("query must not be empty".into()));
        }
        let items = self
            .backend
            .search_history(params.query.trim(), clamp_limit(params.limit))
            .await
            .map_err(backend_error)?;
        Ok(json!({ "count": items.len(), "items": items }))
    }
}

pub struct BookmarksTool {
    definition: ToolDefinition,
    backend: Arc<dyn BrowserBackend>,
}

impl BookmarksTool {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        let definition = ToolDefinition::new(
            GET_BOOKMARKS_TOOL,
            "List the user's bookmarks, optionally filtered by keyword.",
        )
        .with_parameter(ToolParameter::new(
            "query",
            ParameterKind::String,
            "Optional keyword filter",
        ))
        .with_parameter(limit_parameter("Maximum number of bookmarks to return"));
        Self {
            definition,
            backend,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BookmarksArgs {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl BrowserTool for BookmarksTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let params: BookmarksArgs = parse_args(args)?;
        let query = params
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());
        let items = self
            .backend
            .bookmarks(query, clamp_limit(params.limit))
            .await
            .map_err(backend_error)?;
        Ok(json!({ "count": items.len(), "items": items }))
    }
}

pub struct PageContentTool {
    definition: ToolDefinition,
    backend: Arc<dyn BrowserBackend>,
}

impl PageContentTool {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        let definition = ToolDefinition::new(
            GET_PAGE_CONTENT_TOOL,
            "Read the title, URL and text of the page in the active tab.",
        )
        .with_parameter(ToolParameter::new(
            "include_html",
            ParameterKind::Boolean,
            "Also return the raw HTML markup",
        ));
        Self {
            definition,
            backend,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageContentArgs {
    #[serde(default)]
    include_html: bool,
}

#[async_trait]
impl BrowserTool for PageContentTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let params: PageContentArgs = parse_args(args)?;
        let page = self.backend.page_content().await.map_err(backend_error)?;
        let mut content = json!({
            "url": page.url,
            "title": page.title,
            "text": page.text,
            "selectedText": page.selected_text,
        });
        if params.include_html {
            if let Some(map) = content.as_object_mut() {
                map.insert("html".to_string(), json!(page.html));
            }
        }
        Ok(content)
    }
}

pub struct ScreenshotTool {
    definition: ToolDefinition,
    backend: Arc<dyn BrowserBackend>,
}

impl ScreenshotTool {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        Self {
            definition: ToolDefinition::new(
                TAKE_SCREENSHOT_TOOL,
                "Capture a screenshot of the visible part of the active tab.",
            ),
            backend,
        }
    }
}

#[async_trait]
impl BrowserTool for ScreenshotTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        let image = self.backend.screenshot().await.map_err(backend_error)?;
        if image.is_empty() {
            return Err(ToolError::Invocation(
                "screenshot capture returned no data".into(),
            ));
        }
        Ok(json!({ "image": image }))
    }
}

pub struct WebSearchTool {
    definition: ToolDefinition,
    backend: Arc<dyn BrowserBackend>,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        let definition = ToolDefinition::new(WEB_SEARCH_TOOL, "Search the web.")
            .with_parameter(
                ToolParameter::new("query", ParameterKind::String, "Search query").required(),
            )
            .with_parameter(ToolParameter::new(
                "max_results",
                ParameterKind::Number,
                "Maximum number of results",
            ));
        Self {
            definition,
            backend,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebSearchArgs {
    query: String,
    #[serde(default)]
    max_results: Option<usize>,
}

#[async_trait]
impl BrowserTool for WebSearchTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let params: WebSearchArgs = parse_args(args)?;
        if params.query.trim().is_empty() {
            return Err(ToolError::InvalidInput("query must not be empty".into()));
        }
        let results = self
            .backend
            .web_search(params.query.trim(), clamp_limit(params.max_results))
            .await
            .map_err(backend_error)?;
        Ok(json!({ "query": params.query, "results": results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        history_calls: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl BrowserBackend for FakeBackend {
        async fn search_history(
            &self,
            query: &str,
            limit: usize,
        ) -> anyhow::Result<Vec<HistoryItem>> {
            self.history_calls
                .lock()
                .unwrap()
                .push((query.to_string(), limit));
            Ok(vec![HistoryItem {
                title: "Rust book".into(),
                url: "https://doc.rust-lang.org/book/".into(),
                visited_at_ms: Some(1),
            }])
        }

        async fn bookmarks(
            &self,
            _query: Option<&str>,
            _limit: usize,
        ) -> anyhow::Result<Vec<BookmarkItem>> {
            Err(anyhow!("bookmark store locked"))
        }

        async fn page_content(&self) -> anyhow::Result<PageCapture> {
            Ok(PageCapture {
                url: "https://example.com".into(),
                title: "Example".into(),
                text: Some("Hello".into()),
                html: Some("<p>Hello</p>".into()),
                ..PageCapture::default()
            })
        }

        async fn screenshot(&self) -> anyhow::Result<String> {
            Ok(String::new())
        }

        async fn web_search(
            &self,
            query: &str,
            max_results: usize,
        ) -> anyhow::Result<Vec<SearchResult>> {
            Ok((0..max_results.min(2))
                .map(|i| SearchResult {
                    title: format!("{query} {i}"),
                    url: format!("https://search.example/{i}"),
                    snippet: String::new(),
                })
                .collect())
        }
    }

    #[test]
    fn registry_declares_all_browser_tools_in_order() {
        let registry = browser_tool_registry(Arc::new(FakeBackend::default()));
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                SEARCH_HISTORY_TOOL,
                GET_BOOKMARKS_TOOL,
                GET_PAGE_CONTENT_TOOL,
                TAKE_SCREENSHOT_TOOL,
                WEB_SEARCH_TOOL
            ]
        );
        let schema = &registry.to_provider_format()[0]["function"]["parameters"];
        assert_eq!(schema["required"], json!(["query"]));
    }

    #[tokio::test]
    async fn history_search_clamps_limit() {
        let backend = Arc::new(FakeBackend::default());
        let registry = browser_tool_registry(backend.clone());
        let result = registry
            .execute_tool(
                SEARCH_HISTORY_TOOL,
                json!({ "query": " rust ", "limit": 500 }),
            )
            .await;
        assert!(result.error.is_none());
        assert_eq!(result.result.unwrap()["count"], 1);
        assert_eq!(
            backend.history_calls.lock().unwrap().as_slice(),
            &[("rust".to_string(), MAX_RESULT_LIMIT)]
        );
    }

    #[tokio::test]
    async fn invalid_arguments_become_tool_errors() {
        let registry = browser_tool_registry(Arc::new(FakeBackend::default()));
        let result = registry
            .execute_tool(SEARCH_HISTORY_TOOL, json!({ "limit": 3 }))
            .await;
        assert!(result.error.unwrap().contains("invalid arguments"));

        let result = registry
            .execute_tool(WEB_SEARCH_TOOL, json!({ "query": "   " }))
            .await;
        assert!(result.error.unwrap().contains("must not be empty"));
    }

    #[tokio::test]
    async fn backend_failures_are_captured() {
        let registry = browser_tool_registry(Arc::new(FakeBackend::default()));
        let result = registry.execute_tool(GET_BOOKMARKS_TOOL, Value::Null).await;
        assert_eq!(result.result, None);
        assert!(result.error.unwrap().contains("bookmark store locked"));

        let result = registry.execute_tool(TAKE_SCREENSHOT_TOOL, json!({})).await;
        assert!(result.error.unwrap().contains("no data"));
    }

    #[tokio::test]
    async fn page_content_includes_html_on_request() {
        let registry = browser_tool_registry(Arc::new(FakeBackend::default()));
        let plain = registry
            .execute_tool(GET_PAGE_CONTENT_TOOL, json!({}))
            .await
            .result
            .unwrap();
        assert!(plain.get("html").is_none());
        assert_eq!(plain["title"], "Example");

        let with_html = registry
            .execute_tool(GET_PAGE_CONTENT_TOOL, json!({ "include_html": true }))
            .await
            .result
            .unwrap();
        assert_eq!(with_html["html"], "<p>Hello</p>");
    }
}
