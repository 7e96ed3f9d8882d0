use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use assistant_engine::ToolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::context::ProfileName;

pub type SharedConversation = Arc<Mutex<ConversationStore>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Marks assistant messages written by the orchestrator itself rather than
/// by the model. They are shown to the user but never sent back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Notice {
    Error,
    Stopped,
}

/// Snapshot of what context accompanied a user message. Holds sizes and
/// flags only, never page content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub url: String,
    pub has_screenshot: bool,
    pub has_selected_text: bool,
    pub page_content_chars: usize,
    pub history_items: usize,
    pub bookmark_items: usize,
    pub estimated_tokens: usize,
    pub profile: ProfileName,
    /// False when the context was built but not attached to the request.
    pub sent_to_model: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub name: String,
    pub arguments: Value,
}

/// Latency instrumentation, Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTiming {
    pub start_time: u64,
    pub first_token_time: Option<u64>,
    pub time_to_first_token: Option<u64>,
    pub end_time: Option<u64>,
    pub total_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_info: Option<ContextInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    #[serde(default)]
    pub is_tool_execution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<MessageTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<Notice>,
}

/// Everything but the id and creation time, which the store assigns.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub images: Vec<String>,
    pub context_info: Option<ContextInfo>,
    pub tool_call: Option<ToolCallInfo>,
    pub tool_result: Option<ToolResult>,
    pub is_tool_execution: bool,
    pub notice: Option<Notice>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            context_info: None,
            tool_call: None,
            tool_result: None,
            is_tool_execution: false,
            notice: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_context_info(mut self, info: ContextInfo) -> Self {
        self.context_info = Some(info);
        self
    }

    /// Display-only announcement that a tool is about to run.
    pub fn tool_announcement(name: &str, arguments: Value) -> Self {
        Self {
            is_tool_execution: true,
            tool_call: Some(ToolCallInfo {
                name: name.to_string(),
                arguments,
            }),
            ..Self::new(Role::Assistant, format!("Using tool: {name}"))
        }
    }

    pub fn tool_output(result: ToolResult) -> Self {
        let content = match (&result.error, &result.result) {
            (Some(err), _) => format!("Error executing {}: {}", result.name, err),
            (None, None) | (None, Some(Value::Null)) => "No data returned".to_string(),
            (None, Some(value)) => {
                serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
            }
        };
        Self {
            tool_result: Some(result),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn notice(kind: Notice, content: impl Into<String>) -> Self {
        Self {
            notice: Some(kind),
            ..Self::new(Role::Assistant, content)
        }
    }
}

/// Explicit orchestrator phase, mirrored into the store for observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "round", rename_all = "snake_case")]
pub enum TurnPhase {
    #[default]
    Idle,
    BuildingContext,
    Requesting(u32),
    ToolsPending(u32),
    ExecutingTools(u32),
    Completed,
    Cancelled,
    Failed,
}

/// Proof that the holder owns the live round of a live turn. Round-scoped
/// mutations are rejected once the round is closed, cancelled, or cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundToken {
    pub turn: TurnId,
    pub round: u32,
    pub message: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoundError {
    #[error("a turn is already in progress")]
    TurnInProgress,
    #[error("turn is no longer active")]
    TurnNotActive,
    #[error("round {0} is still open")]
    RoundStillOpen(u32),
    #[error("round token is stale")]
    StaleRound,
}

#[derive(Debug, Clone, Copy)]
struct ActiveTurn {
    id: TurnId,
    next_round: u32,
    round: Option<RoundToken>,
}

/// Authoritative conversation state for one session.
#[derive(Debug, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    is_streaming: bool,
    current_model: Option<String>,
    streaming_content: String,
    error: Option<String>,
    planning_mode: bool,
    phase: TurnPhase,
    active: Option<ActiveTurn>,
    next_message_id: u64,
    next_turn_id: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedConversation {
        Arc::new(Mutex::new(self))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn streaming_content(&self) -> &str {
        &self.streaming_content
    }

    pub fn current_model(&self) -> Option<&str> {
        self.current_model.as_deref()
    }

    pub fn set_current_model(&mut self, model: Option<String>) {
        self.current_model = model.filter(|m| !m.trim().is_empty());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    pub fn planning_mode(&self) -> bool {
        self.planning_mode
    }

    pub fn set_planning_mode(&mut self, enabled: bool) {
        self.planning_mode = enabled;
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_user_messages(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::User)
    }

    pub fn add_message(&mut self, new: NewMessage) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        self.messages.push(Message {
            id,
            role: new.role,
            content: new.content,
            created_at_ms: now_ms(),
            images: new.images,
            context_info: new.context_info,
            tool_call: new.tool_call,
            tool_result: new.tool_result,
            is_tool_execution: new.is_tool_execution,
            thinking: None,
            timing: None,
            notice: new.notice,
        });
        id
    }

    pub fn start_new_message(&mut self, role: Role) -> MessageId {
        self.add_message(NewMessage::new(role, String::new()))
    }

    /// Appends to whatever message is last. Round-aware callers use
    /// [`ConversationStore::append_token`] instead.
    pub fn append_to_last_message(&mut self, text: &str) {
        if let Some(last) = self.messages.last_mut() {
            last.content.push_str(text);
        }
    }

    /// Resets history, error, and streaming state. Any active turn is
    /// abandoned; its tokens are rejected from here on.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.error = None;
        self.streaming_content.clear();
        self.is_streaming = false;
        self.active = None;
        self.phase = TurnPhase::Idle;
    }

    pub fn begin_turn(&mut self) -> Result<TurnId, RoundError> {
        if self.active.is_some() {
            return Err(RoundError::TurnInProgress);
        }
        let id = TurnId(self.next_turn_id);
        self.next_turn_id += 1;
        self.active = Some(ActiveTurn {
            id,
            next_round: 0,
            round: None,
        });
        self.error = None;
        self.phase = TurnPhase::BuildingContext;
        Ok(id)
    }

    pub fn is_turn_active(&self, turn: TurnId) -> bool {
        self.active.is_some_and(|active| active.id == turn)
    }

    pub fn is_round_current(&self, token: &RoundToken) -> bool {
        self.active
            .and_then(|active| active.round)
            .is_some_and(|round| round == *token)
            && self.messages.last().is_some_and(|m| m.id == token.message)
    }

    pub fn set_phase(&mut self, turn: TurnId, phase: TurnPhase) -> Result<(), RoundError> {
        self.ensure_turn(turn)?;
        self.phase = phase;
        Ok(())
    }

    /// Appends a message on behalf of a live turn.
    pub fn push_for_turn(
        &mut self,
        turn: TurnId,
        new: NewMessage,
    ) -> Result<MessageId, RoundError> {
        self.ensure_turn(turn)?;
        if let Some(round) = self.active.and_then(|active| active.round) {
            return Err(RoundError::RoundStillOpen(round.round));
        }
        Ok(self.add_message(new))
    }

    /// Opens the assistant placeholder for the next round of `turn`.
    pub fn open_round(&mut self, turn: TurnId) -> Result<RoundToken, RoundError> {
        let active = self.ensure_turn(turn)?;
        if let Some(round) = active.round {
            return Err(RoundError::RoundStillOpen(round.round));
        }
        let round = active.next_round;

        let message = self.start_new_message(Role::Assistant);
        if let Some(last) = self.messages.last_mut() {
            last.timing = Some(MessageTiming {
                start_time: now_ms(),
                ..MessageTiming::default()
            });
        }

        let token = RoundToken {
            turn,
            round,
            message,
        };
        self.active = Some(ActiveTurn {
            id: turn,
            next_round: round + 1,
            round: Some(token),
        });
        self.is_streaming = true;
        self.streaming_content.clear();
        self.phase = TurnPhase::Requesting(round);
        Ok(token)
    }

    pub fn append_token(&mut self, token: &RoundToken, text: &str) -> Result<(), RoundError> {
        let message = self.round_message_mut(token)?;
        message.content.push_str(text);
        if let Some(timing) = message.timing.as_mut() {
            if timing.first_token_time.is_none() {
                let now = now_ms();
                timing.first_token_time = Some(now);
                timing.time_to_first_token = Some(now.saturating_sub(timing.start_time));
            }
        }
        self.streaming_content.push_str(text);
        Ok(())
    }

    pub fn append_reasoning(&mut self, token: &RoundToken, text: &str) -> Result<(), RoundError> {
        let message = self.round_message_mut(token)?;
        message
            .thinking
            .get_or_insert_with(String::new)
            .push_str(text);
        Ok(())
    }

    /// Settles the round's placeholder and stops streaming.
    pub fn close_round(&mut self, token: &RoundToken) -> Result<(), RoundError> {
        let message = self.round_message_mut(token)?;
        if let Some(timing) = message.timing.as_mut() {
            let now = now_ms();
            timing.end_time = Some(now);
            timing.total_time = Some(now.saturating_sub(timing.start_time));
        }
        self.is_streaming = false;
        self.streaming_content.clear();
        if let Some(active) = self.active.as_mut() {
            active.round = None;
        }
        Ok(())
    }

    pub fn end_turn(&mut self, turn: TurnId) -> Result<(), RoundError> {
        let active = self.ensure_turn(turn)?;
        if let Some(round) = active.round {
            return Err(RoundError::RoundStillOpen(round.round));
        }
        self.active = None;
        self.is_streaming = false;
        self.streaming_content.clear();
        self.phase = TurnPhase::Completed;
        Ok(())
    }

    /// Stops the active turn, if any, and appends one "stopped" notice.
    /// Content already streamed is left as is.
    pub fn cancel_active(&mut self, stopped_message: &str) -> bool {
        if self.active.take().is_none() {
            return false;
        }
        self.is_streaming = false;
        self.streaming_content.clear();
        self.phase = TurnPhase::Cancelled;
        self.add_message(NewMessage::notice(Notice::Stopped, stopped_message));
        true
    }

    /// Terminates `turn` with a visible error. A turn that was already
    /// cancelled or cleared is left alone.
    pub fn fail_turn(&mut self, turn: TurnId, user_message: &str) -> bool {
        if !self.is_turn_active(turn) {
            return false;
        }
        self.active = None;
        self.is_streaming = false;
        self.streaming_content.clear();
        self.error = Some(user_message.to_string());
        self.phase = TurnPhase::Failed;
        self.add_message(NewMessage::notice(Notice::Error, user_message));
        true
    }

    fn ensure_turn(&self, turn: TurnId) -> Result<ActiveTurn, RoundError> {
        match self.active {
            Some(active) if active.id == turn => Ok(active),
            _ => Err(RoundError::TurnNotActive),
        }
    }

    fn round_message_mut(&mut self, token: &RoundToken) -> Result<&mut Message, RoundError> {
        if !self.is_turn_active(token.turn) {
            return Err(RoundError::TurnNotActive);
        }
        if !self.is_round_current(token) {
            return Err(RoundError::StaleRound);
        }
        self.messages.last_mut().ok_or(RoundError::StaleRound)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_insertion_ordered() {
        let mut store = ConversationStore::new();
        let a = store.add_message(NewMessage::user("one"));
        let b = store.start_new_message(Role::Assistant);
        assert!(a < b);
        assert_eq!(store.message(b).unwrap().content, "");
    }

    #[test]
    fn append_to_last_message_only_touches_newest() {
        let mut store = ConversationStore::new();
        store.add_message(NewMessage::new(Role::Assistant, "earlier"));
        store.start_new_message(Role::Assistant);
        for token in ["Hel", "lo", ", ", "world"] {
            store.append_to_last_message(token);
        }
        assert_eq!(store.messages()[0].content, "earlier");
        assert_eq!(store.messages()[1].content, "Hello, world");
    }

    #[test]
    fn round_tokens_accumulate_in_order_and_stamp_first_token() {
        let mut store = ConversationStore::new();
        let turn = store.begin_turn().unwrap();
        let round = store.open_round(turn).unwrap();
        assert!(store.is_streaming());

        store.append_token(&round, "a").unwrap();
        store.append_token(&round, "b").unwrap();
        store.append_reasoning(&round, "thinking").unwrap();
        store.append_token(&round, "c").unwrap();
        assert_eq!(store.streaming_content(), "abc");

        let message = store.message(round.message).unwrap();
        assert_eq!(message.content, "abc");
        assert_eq!(message.thinking.as_deref(), Some("thinking"));
        let timing = message.timing.unwrap();
        assert!(timing.first_token_time.is_some());
        assert!(timing.time_to_first_token.is_some());

        store.close_round(&round).unwrap();
        let timing = store.message(round.message).unwrap().timing.unwrap();
        assert!(timing.end_time.is_some());
        assert!(timing.total_time.is_some());
        assert!(!store.is_streaming());
        assert_eq!(store.streaming_content(), "");
        store.end_turn(turn).unwrap();
        assert_eq!(store.phase(), TurnPhase::Completed);
    }

    #[test]
    fn second_turn_is_rejected_while_first_is_live() {
        let mut store = ConversationStore::new();
        let turn = store.begin_turn().unwrap();
        assert_eq!(store.begin_turn(), Err(RoundError::TurnInProgress));
        store.end_turn(turn).unwrap();
        assert!(store.begin_turn().is_ok());
    }

    #[test]
    fn stale_round_cannot_mutate() {
        let mut store = ConversationStore::new();
        let turn = store.begin_turn().unwrap();
        let first = store.open_round(turn).unwrap();
        store.append_token(&first, "one").unwrap();
        store.close_round(&first).unwrap();
        let second = store.open_round(turn).unwrap();

        assert_eq!(
            store.append_token(&first, "late"),
            Err(RoundError::StaleRound)
        );
        store.append_token(&second, "two").unwrap();
        assert_eq!(store.message(first.message).unwrap().content, "one");
        assert_eq!(store.message(second.message).unwrap().content, "two");
        assert_eq!(second.round, 1);
    }

    #[test]
    fn messages_cannot_be_pushed_while_round_is_open() {
        let mut store = ConversationStore::new();
        let turn = store.begin_turn().unwrap();
        let round = store.open_round(turn).unwrap();
        let err = store
            .push_for_turn(turn, NewMessage::tool_announcement("web_search", json!({})))
            .unwrap_err();
        assert_eq!(err, RoundError::RoundStillOpen(0));
        store.close_round(&round).unwrap();
        assert!(store
            .push_for_turn(turn, NewMessage::tool_announcement("web_search", json!({})))
            .is_ok());
    }

    #[test]
    fn cancel_appends_exactly_one_notice_and_keeps_content() {
        let mut store = ConversationStore::new();
        let turn = store.begin_turn().unwrap();
        let round = store.open_round(turn).unwrap();
        store.append_token(&round, "partial").unwrap();

        assert!(store.cancel_active("stopped"));
        assert!(!store.cancel_active("stopped"));
        assert!(!store.is_streaming());
        assert_eq!(store.streaming_content(), "");
        assert_eq!(store.message(round.message).unwrap().content, "partial");
        assert_eq!(
            store
                .messages()
                .iter()
                .filter(|m| m.notice == Some(Notice::Stopped))
                .count(),
            1
        );
        assert_eq!(
            store.append_token(&round, "more"),
            Err(RoundError::TurnNotActive)
        );
        assert!(!store.fail_turn(turn, "too late"));
    }

    #[test]
    fn phase_settles_when_turn_leaves() {
        let mut store = ConversationStore::new();
        assert_eq!(store.phase(), TurnPhase::Idle);

        let turn = store.begin_turn().unwrap();
        assert_eq!(store.phase(), TurnPhase::BuildingContext);
        let round = store.open_round(turn).unwrap();
        assert_eq!(store.phase(), TurnPhase::Requesting(0));
        store.close_round(&round).unwrap();
        store.set_phase(turn, TurnPhase::ExecutingTools(0)).unwrap();
        assert!(store.is_busy());

        assert!(store.fail_turn(turn, "boom"));
        assert_eq!(store.phase(), TurnPhase::Failed);
        assert!(!store.is_busy());
        assert_eq!(
            store.set_phase(turn, TurnPhase::ToolsPending(1)),
            Err(RoundError::TurnNotActive)
        );
        assert_eq!(store.phase(), TurnPhase::Failed);

        let next = store.begin_turn().unwrap();
        assert!(store.cancel_active("stopped"));
        assert_eq!(store.phase(), TurnPhase::Cancelled);
        assert!(store.set_phase(next, TurnPhase::Requesting(0)).is_err());
    }

    #[test]
    fn clear_messages_abandons_active_turn() {
        let mut store = ConversationStore::new();
        store.set_error(Some("old".into()));
        let turn = store.begin_turn().unwrap();
        let round = store.open_round(turn).unwrap();
        store.append_token(&round, "x").unwrap();

        store.clear_messages();
        assert!(store.messages().is_empty());
        assert!(store.error().is_none());
        assert_eq!(store.streaming_content(), "");
        assert!(store.append_token(&round, "y").is_err());
        assert!(store.messages().is_empty());
    }

    #[test]
    fn tool_output_content_reflects_outcome() {
        let ok = NewMessage::tool_output(ToolResult::success("web_search", json!({ "hits": 2 })));
        assert_eq!(ok.content, r#"{"hits":2}"#);
        let empty = NewMessage::tool_output(ToolResult::success("take_screenshot", Value::Null));
        assert_eq!(empty.content, "No data returned");
        let failed = NewMessage::tool_output(ToolResult::failure("get_bookmarks", "denied"));
        assert_eq!(failed.content, "Error executing get_bookmarks: denied");
        assert_eq!(failed.role, Role::Tool);
    }
}
