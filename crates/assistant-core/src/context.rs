//! Token-bounded page and browsing context for a chat request.
//!
//! The builder never blocks a request: it only trims what it was given and
//! reports a rough token estimate the orchestrator can log and surface.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const ELLIPSIS: &str = "...";
const SCREENSHOT_TITLE_LIMIT: usize = 200;
const ITEM_TITLE_LIMIT: usize = 100;
const ITEM_URL_LIMIT: usize = 200;
const CHARS_PER_TOKEN: usize = 4;
const TOKENS_PER_ITEM: usize = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    #[default]
    Normal,
    QuickAnswer,
    DeepAnalysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileName {
    Minimal,
    Default,
    Full,
    DeepAnalysis,
    Vision,
    VisionWithScreenshot,
}

/// Truncation and inclusion knobs applied while assembling context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextLimits {
    pub profile: ProfileName,
    pub max_page_content_length: usize,
    pub max_history_items: usize,
    pub max_bookmark_items: usize,
    pub include_history: bool,
    pub include_bookmarks: bool,
    pub prefer_screenshot_for_vision: bool,
    pub summarize_content: bool,
}

impl ContextLimits {
    pub const fn minimal() -> Self {
        Self {
            profile: ProfileName::Minimal,
            max_page_content_length: 1000,
            max_history_items: 0,
            max_bookmark_items: 0,
            include_history: false,
            include_bookmarks: false,
            prefer_screenshot_for_vision: true,
            summarize_content: true,
        }
    }

    pub const fn balanced() -> Self {
        Self {
            profile: ProfileName::Default,
            max_page_content_length: 3000,
            max_history_items: 10,
            max_bookmark_items: 10,
            include_history: true,
            include_bookmarks: true,
            prefer_screenshot_for_vision: true,
            summarize_content: true,
        }
    }

    pub const fn full() -> Self {
        Self {
            profile: ProfileName::Full,
            max_page_content_length: 8000,
            max_history_items: 25,
            max_bookmark_items: 25,
            include_history: true,
            include_bookmarks: true,
            prefer_screenshot_for_vision: false,
            summarize_content: false,
        }
    }

    pub const fn deep_analysis() -> Self {
        let mut limits = Self::full();
        limits.profile = ProfileName::DeepAnalysis;
        limits.max_page_content_length = 15_000;
        limits
    }

    pub const fn vision() -> Self {
        Self::balanced()
            .without_browsing_data(ProfileName::Vision, 300)
    }

    pub const fn vision_with_screenshot() -> Self {
        Self::balanced()
            .without_browsing_data(ProfileName::VisionWithScreenshot, 100)
    }

    const fn without_browsing_data(mut self, profile: ProfileName, page_cap: usize) -> Self {
        self.profile = profile;
        self.max_page_content_length = page_cap;
        self.max_history_items = 0;
        self.max_bookmark_items = 0;
        self.include_history = false;
        self.include_bookmarks = false;
        self
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Picks the limits profile for a request. Vision requests get the smallest
/// budgets and no browsing data.
pub fn recommended_limits(
    is_vision_model: bool,
    has_screenshot: bool,
    use_case: UseCase,
) -> ContextLimits {
    match (is_vision_model, has_screenshot, use_case) {
        (true, true, _) => ContextLimits::vision_with_screenshot(),
        (true, false, _) => ContextLimits::vision(),
        (false, _, UseCase::QuickAnswer) => ContextLimits::minimal(),
        (false, _, UseCase::DeepAnalysis) => ContextLimits::deep_analysis(),
        (false, _, UseCase::Normal) => ContextLimits::balanced(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCapture {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    /// Base64 image or data URL.
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub selected_text: Option<String>,
}

impl PageCapture {
    pub fn has_screenshot(&self) -> bool {
        self.screenshot.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_selected_text(&self) -> bool {
        self.selected_text
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visited_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkItem {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowsingContext {
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    #[serde(default)]
    pub bookmarks: Vec<BookmarkItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

/// Payload attached to the first request of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedContext {
    pub page: PageContext,
    pub history: Vec<HistoryItem>,
    pub bookmarks: Vec<BookmarkItem>,
    pub estimated_tokens: usize,
    pub profile: ProfileName,
}

/// Rough token accounting. The default is a character heuristic, not a real
/// tokenizer; swap in a better one without touching orchestration.
pub trait TokenEstimator: Send + Sync {
    fn estimate_chars(&self, chars: usize) -> usize;
    /// Flat cost charged for each history or bookmark entry.
    fn per_item_overhead(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate_chars(&self, chars: usize) -> usize {
        chars.div_ceil(CHARS_PER_TOKEN)
    }

    fn per_item_overhead(&self) -> usize {
        TOKENS_PER_ITEM
    }
}

#[derive(Clone)]
pub struct ContextBuilder {
    estimator: Arc<dyn TokenEstimator>,
    selected_text_limit: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            estimator: Arc::new(HeuristicEstimator),
            selected_text_limit: crate::config::DEFAULT_SELECTED_TEXT_LIMIT,
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_selected_text_limit(mut self, limit: usize) -> Self {
        self.selected_text_limit = limit;
        self
    }

    pub fn build_optimized_context(
        &self,
        page: &PageCapture,
        browsing: &BrowsingContext,
        is_vision_model: bool,
        limits: &ContextLimits,
    ) -> OptimizedContext {
        let screenshot_mode =
            is_vision_model && page.has_screenshot() && limits.prefer_screenshot_for_vision;

        let content = if screenshot_mode {
            page.title.chars().take(SCREENSHOT_TITLE_LIMIT).collect()
        } else {
            let text = extract_page_text(page, limits);
            truncate_text(&text, limits.max_page_content_length)
        };

        let selected_text = page
            .selected_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(|text| truncate_text(text, self.selected_text_limit));

        let history: Vec<HistoryItem> = if limits.include_history {
            browsing
                .history
                .iter()
                .take(limits.max_history_items)
                .map(|item| HistoryItem {
                    title: truncate_text(&item.title, ITEM_TITLE_LIMIT),
                    url: truncate_text(&item.url, ITEM_URL_LIMIT),
                    visited_at_ms: item.visited_at_ms,
                })
                .collect()
        } else {
            Vec::new()
        };

        let bookmarks: Vec<BookmarkItem> = if limits.include_bookmarks {
            browsing
                .bookmarks
                .iter()
                .take(limits.max_bookmark_items)
                .map(|item| BookmarkItem {
                    title: truncate_text(&item.title, ITEM_TITLE_LIMIT),
                    url: truncate_text(&item.url, ITEM_URL_LIMIT),
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut chars = content.chars().count();
        chars += selected_text.as_deref().map_or(0, |s| s.chars().count());
        chars += history
            .iter()
            .map(|item| item.title.chars().count() + item.url.chars().count())
            .sum::<usize>();
        chars += bookmarks
            .iter()
            .map(|item| item.title.chars().count() + item.url.chars().count())
            .sum::<usize>();
        let item_count = history.len() + bookmarks.len();
        let estimated_tokens =
            self.estimator.estimate_chars(chars) + item_count * self.estimator.per_item_overhead();

        OptimizedContext {
            page: PageContext {
                url: page.url.clone(),
                title: page.title.clone(),
                content,
                selected_text,
                screenshot: if is_vision_model {
                    page.screenshot.clone().filter(|s| !s.is_empty())
                } else {
                    None
                },
            },
            history,
            bookmarks,
            estimated_tokens,
            profile: limits.profile,
        }
    }
}

fn extract_page_text(page: &PageCapture, limits: &ContextLimits) -> String {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if limits.summarize_content {
        if let Some(summary) = non_empty(&page.summary) {
            return summary;
        }
    }
    if let Some(text) = non_empty(&page.text) {
        return text;
    }
    page.html.as_deref().map(strip_tags).unwrap_or_default()
}

/// Returns `text` unchanged when it fits, otherwise its first `max_chars`
/// characters followed by `...`.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}{}", &text[..cut], ELLIPSIS),
    }
}

static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| compile(r"(?is)<script\b[^>]*>.*?</script\s*>"));
static STYLE_BLOCK: Lazy<Regex> = Lazy::new(|| compile(r"(?is)<style\b[^>]*>.*?</style\s*>"));
static TAG: Lazy<Regex> = Lazy::new(|| compile(r"(?s)<[^>]*>"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| compile(r"\s+"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

/// Crude markup-to-text fallback for pages without extracted text.
pub fn strip_tags(html: &str) -> String {
    let text = SCRIPT_BLOCK.replace_all(html, " ");
    let text = STYLE_BLOCK.replace_all(&text, " ");
    let text = TAG.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_text(len: usize) -> PageCapture {
        PageCapture {
            url: "https://example.com/article".into(),
            title: "Example article".into(),
            text: Some("x".repeat(len)),
            ..PageCapture::default()
        }
    }

    fn browsing(items: usize) -> BrowsingContext {
        BrowsingContext {
            history: (0..items)
                .map(|i| HistoryItem {
                    title: format!("History {i}"),
                    url: format!("https://h.example/{i}"),
                    visited_at_ms: None,
                })
                .collect(),
            bookmarks: (0..items)
                .map(|i| BookmarkItem {
                    title: format!("Bookmark {i}"),
                    url: format!("https://b.example/{i}"),
                })
                .collect(),
        }
    }

    #[test]
    fn truncate_text_appends_ellipsis_only_when_cut() {
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hi", 5), "hi");
        assert_eq!(truncate_text("hello", 5), "hello");
        assert_eq!(truncate_text("héllo wörld", 4), "héll...");
    }

    #[test]
    fn vision_with_screenshot_is_smallest() {
        let limits = recommended_limits(true, true, UseCase::Normal);
        assert!(!limits.include_history);
        assert!(!limits.include_bookmarks);
        assert_eq!(limits.max_page_content_length, 100);
        assert_eq!(limits.profile, ProfileName::VisionWithScreenshot);

        let limits = recommended_limits(true, false, UseCase::DeepAnalysis);
        assert_eq!(limits.max_page_content_length, 300);
        assert!(!limits.include_history);
    }

    #[test]
    fn use_case_selects_profile_for_text_models() {
        assert_eq!(
            recommended_limits(false, false, UseCase::QuickAnswer),
            ContextLimits::minimal()
        );
        assert_eq!(
            recommended_limits(false, true, UseCase::Normal),
            ContextLimits::balanced()
        );
        let deep = recommended_limits(false, false, UseCase::DeepAnalysis);
        assert_eq!(deep.profile, ProfileName::DeepAnalysis);
        assert_eq!(deep.max_page_content_length, 15_000);
    }

    #[test]
    fn screenshot_mode_reduces_content_to_title() {
        let mut page = page_with_text(10_000);
        page.title = "T".repeat(5_000);
        page.screenshot = Some("data:image/png;base64,AAAA".into());
        let limits = ContextLimits::balanced();

        let ctx = ContextBuilder::new().build_optimized_context(
            &page,
            &BrowsingContext::default(),
            true,
            &limits,
        );
        assert!(ctx.page.content.chars().count() <= 200);
        assert!(ctx.page.content.chars().all(|c| c == 'T'));
        assert!(ctx.page.screenshot.is_some());
    }

    #[test]
    fn text_models_never_receive_screenshots() {
        let mut page = page_with_text(50);
        page.screenshot = Some("data:image/png;base64,AAAA".into());
        let ctx = ContextBuilder::new().build_optimized_context(
            &page,
            &BrowsingContext::default(),
            false,
            &ContextLimits::balanced(),
        );
        assert_eq!(ctx.page.content.len(), 50);
        assert!(ctx.page.screenshot.is_none());
    }

    #[test]
    fn prefers_summary_then_text_then_markup() {
        let mut page = PageCapture {
            summary: Some("short summary".into()),
            text: Some("full text".into()),
            html: Some("<p>markup <b>text</b></p>".into()),
            ..PageCapture::default()
        };
        let builder = ContextBuilder::new();
        let none = BrowsingContext::default();

        let ctx = builder.build_optimized_context(&page, &none, false, &ContextLimits::balanced());
        assert_eq!(ctx.page.content, "short summary");

        let ctx = builder.build_optimized_context(&page, &none, false, &ContextLimits::full());
        assert_eq!(ctx.page.content, "full text");

        page.text = None;
        let ctx = builder.build_optimized_context(&page, &none, false, &ContextLimits::full());
        assert_eq!(ctx.page.content, "markup text");
    }

    #[test]
    fn page_content_is_capped_with_marker() {
        let ctx = ContextBuilder::new().build_optimized_context(
            &page_with_text(5_000),
            &BrowsingContext::default(),
            false,
            &ContextLimits::balanced(),
        );
        assert_eq!(ctx.page.content.len(), 3000 + ELLIPSIS.len());
        assert!(ctx.page.content.ends_with(ELLIPSIS));
    }

    #[test]
    fn selected_text_is_truncated_independently() {
        let mut page = page_with_text(10);
        page.selected_text = Some("s".repeat(900));
        let ctx = ContextBuilder::new().build_optimized_context(
            &page,
            &BrowsingContext::default(),
            false,
            &ContextLimits::minimal(),
        );
        let selected = ctx.page.selected_text.unwrap();
        assert_eq!(selected.chars().count(), 500 + ELLIPSIS.len());
    }

    #[test]
    fn estimate_counts_chars_and_item_surcharge() {
        let ctx = ContextBuilder::new().build_optimized_context(
            &page_with_text(401),
            &BrowsingContext::default(),
            false,
            &ContextLimits::balanced(),
        );
        assert_eq!(ctx.estimated_tokens, 101);

        let data = browsing(2);
        let ctx = ContextBuilder::new().build_optimized_context(
            &page_with_text(0),
            &data,
            false,
            &ContextLimits::balanced(),
        );
        let item_chars: usize = data
            .history
            .iter()
            .map(|i| i.title.len() + i.url.len())
            .chain(data.bookmarks.iter().map(|i| i.title.len() + i.url.len()))
            .sum();
        assert_eq!(ctx.estimated_tokens, item_chars.div_ceil(4) + 4 * 60);
    }

    #[test]
    fn browsing_data_respects_profile() {
        let data = browsing(30);
        let builder = ContextBuilder::new();
        let page = page_with_text(10);

        let ctx = builder.build_optimized_context(&page, &data, false, &ContextLimits::balanced());
        assert_eq!(ctx.history.len(), 10);
        assert_eq!(ctx.bookmarks.len(), 10);

        let ctx = builder.build_optimized_context(&page, &data, false, &ContextLimits::minimal());
        assert!(ctx.history.is_empty());
        assert!(ctx.bookmarks.is_empty());
    }

    struct FlatEstimator;

    impl TokenEstimator for FlatEstimator {
        fn estimate_chars(&self, _chars: usize) -> usize {
            7
        }

        fn per_item_overhead(&self) -> usize {
            0
        }
    }

    #[test]
    fn estimator_is_replaceable() {
        let builder = ContextBuilder::new().with_estimator(Arc::new(FlatEstimator));
        let ctx = builder.build_optimized_context(
            &page_with_text(10_000),
            &browsing(3),
            false,
            &ContextLimits::full(),
        );
        assert_eq!(ctx.estimated_tokens, 7);
    }

    #[test]
    fn strip_tags_drops_scripts_and_entities() {
        let html = "<html><head><style>p{}</style><script>var a = 1;</script></head>\
                    <body><h1>Title</h1>\n<p>Fish &amp; chips</p></body></html>";
        assert_eq!(strip_tags(html), "Title Fish & chips");
    }
}
