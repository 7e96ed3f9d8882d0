//! Collaborator seams for the browser assistant: the streaming inference
//! engine, the tools the assistant may call, and the static model capability
//! table the orchestrator consults on every turn.

pub mod engine;
pub mod models;
pub mod tools;

pub use engine::{
    ChatRequest, EngineEvent, EngineMessage, EngineRole, EngineStream, InferenceEngine,
    ToolCallRequest,
};
pub use models::{ModelCapabilities, ModelMetadata, ModelRegistry};
pub use tools::{
    BrowserTool, ParameterKind, ToolDefinition, ToolError, ToolParameter, ToolRegistry, ToolResult,
};
