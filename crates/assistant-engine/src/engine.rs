use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message as the inference engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMessage {
    pub role: EngineRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Set on tool-role messages so the engine can pair results with calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl EngineMessage {
    pub fn new(role: EngineRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_name: None,
        }
    }
}

/// A single chat submission. `context` and `tools` are opaque JSON payloads;
/// their byte layout on the wire is the engine's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<EngineMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Everything the engine reports for one round, multiplexed onto one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    Token(String),
    Reasoning(String),
    ToolCallBatch(Vec<ToolCallRequest>),
    /// The submission resolved. Nothing follows.
    Settled,
    /// The submission raised after the stream opened. Nothing follows.
    Failed(String),
}

pub type EngineStream = BoxStream<'static, EngineEvent>;

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Opens a round. An `Err` here means the request never got a stream
    /// (refused connection, bad model name, ...).
    async fn submit_chat(&self, request: ChatRequest) -> Result<EngineStream>;

    /// Best-effort abort of whatever round is in flight.
    fn cancel(&self);
}
