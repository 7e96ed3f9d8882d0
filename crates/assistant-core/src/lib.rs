//! Conversation turn orchestration for the browser assistant: context
//! shaping, the conversation store, browser tools and the tool-calling loop.

pub mod browser_tools;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod orchestrator;

pub use browser_tools::{browser_tool_registry, BrowserBackend, SearchResult};
pub use config::{AssistantConfig, ConfigError};
pub use context::{
    recommended_limits, BookmarkItem, BrowsingContext, ContextBuilder, ContextLimits,
    HeuristicEstimator, HistoryItem, OptimizedContext, PageCapture, PageContext, ProfileName,
    TokenEstimator, UseCase,
};
pub use conversation::{
    ContextInfo, ConversationStore, Message, MessageId, MessageTiming, NewMessage, Notice, Role,
    RoundError, RoundToken, SharedConversation, ToolCallInfo, TurnId, TurnPhase,
};
pub use error::ChatError;
pub use orchestrator::{
    ChatTurnRequest, PageContextRequest, TurnOrchestrator, TurnOrchestratorBuilder, TurnOutcome,
    TurnStatus,
};
