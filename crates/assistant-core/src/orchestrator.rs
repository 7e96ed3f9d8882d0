//! Drives one user prompt through context building, streaming, and any
//! number of tool sub-rounds until the model settles on a plain answer.

use std::sync::Arc;

use assistant_engine::{
    ChatRequest, EngineEvent, EngineMessage, EngineRole, InferenceEngine, ModelCapabilities,
    ModelRegistry, ToolCallRequest, ToolRegistry,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::AssistantConfig;
use crate::context::{
    recommended_limits, BrowsingContext, ContextBuilder, OptimizedContext, PageCapture,
    TokenEstimator, UseCase,
};
use crate::conversation::{
    ContextInfo, Message, NewMessage, Role, RoundToken, SharedConversation, TurnId, TurnPhase,
};
use crate::error::ChatError;

/// Page data captured by the browser for the current tab.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageContextRequest {
    pub page: PageCapture,
    #[serde(default)]
    pub browsing: BrowsingContext,
}

#[derive(Debug, Clone, Default)]
pub struct ChatTurnRequest {
    pub prompt: String,
    pub images: Vec<String>,
    pub page_context: Option<PageContextRequest>,
    /// Falls back to the configured default when unset.
    pub use_case: Option<UseCase>,
}

impl ChatTurnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_page_context(mut self, page: PageCapture, browsing: BrowsingContext) -> Self {
        self.page_context = Some(PageContextRequest { page, browsing });
        self
    }

    pub fn with_use_case(mut self, use_case: UseCase) -> Self {
        self.use_case = Some(use_case);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Heuristic estimate for the context built this turn, if any.
    pub token_estimate: Option<usize>,
    /// Engine requests issued, tool follow-ups included.
    pub rounds: u32,
}

enum RoundEnd {
    Completed,
    ToolCalls(Vec<ToolCallRequest>),
    Interrupted,
    Failed(ChatError),
}

/// Per-turn facts fixed before the first request goes out.
struct TurnPlan {
    turn: TurnId,
    model: String,
    capabilities: ModelCapabilities,
    tools: Option<Vec<Value>>,
    token_estimate: Option<usize>,
}

pub struct TurnOrchestrator {
    engine: Arc<dyn InferenceEngine>,
    tools: ToolRegistry,
    models: ModelRegistry,
    context_builder: ContextBuilder,
    store: SharedConversation,
    config: AssistantConfig,
    cancel_signal: Notify,
}

impl TurnOrchestrator {
    pub fn builder(
        engine: Arc<dyn InferenceEngine>,
        store: SharedConversation,
    ) -> TurnOrchestratorBuilder {
        TurnOrchestratorBuilder::new(engine, store)
    }

    pub fn store(&self) -> &SharedConversation {
        &self.store
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub async fn send_chat_message(
        &self,
        request: ChatTurnRequest,
    ) -> Result<TurnOutcome, ChatError> {
        let (turn, model, planning_mode, first_user_message) = {
            let mut store = self.store.lock().await;
            let Some(model) = store.current_model().map(str::to_string) else {
                let err = ChatError::NoModelSelected;
                store.set_error(Some(err.user_message()));
                warn!("refusing chat turn: no model selected");
                return Err(err);
            };
            let turn = store.begin_turn().map_err(|_| {
                warn!("refusing chat turn: another turn is still running");
                ChatError::TurnInProgress
            })?;
            let first_user_message = !store.has_user_messages();
            (turn, model, store.planning_mode(), first_user_message)
        };

        let capabilities = self.models.capabilities(&model);
        let offer_tools = planning_mode && capabilities.tool_calling && !self.tools.is_empty();
        info!(
            model = %model,
            planning_mode,
            offer_tools,
            vision = capabilities.vision,
            "starting chat turn"
        );

        let use_case = request.use_case.unwrap_or(self.config.default_use_case);
        let context = request.page_context.as_ref().map(|pc| {
            let limits =
                recommended_limits(capabilities.vision, pc.page.has_screenshot(), use_case);
            self.context_builder.build_optimized_context(
                &pc.page,
                &pc.browsing,
                capabilities.vision,
                &limits,
            )
        });
        let attach_context = first_user_message && context.is_some();
        if let Some(ctx) = &context {
            debug!(
                profile = ?ctx.profile,
                estimated_tokens = ctx.estimated_tokens,
                attach_context,
                "built page context"
            );
        }

        if !request.images.is_empty() && !capabilities.vision {
            warn!(model = %model, "model lacks vision; images stay local to the conversation");
        }

        let mut user_message = NewMessage::user(request.prompt).with_images(request.images);
        if let (Some(ctx), Some(pc)) = (&context, &request.page_context) {
            user_message =
                user_message.with_context_info(context_info(ctx, &pc.page, attach_context));
        }
        if self
            .store
            .lock()
            .await
            .push_for_turn(turn, user_message)
            .is_err()
        {
            return Ok(cancelled(None, 0));
        }

        let pending_context = if attach_context {
            context.as_ref().and_then(|ctx| match serde_json::to_value(ctx) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(error = %err, "dropping context that failed to serialize");
                    None
                }
            })
        } else {
            None
        };

        let plan = TurnPlan {
            turn,
            model,
            capabilities,
            tools: offer_tools.then(|| self.tools.to_provider_format()),
            token_estimate: context.as_ref().map(|ctx| ctx.estimated_tokens),
        };
        self.run_rounds(plan, pending_context).await
    }

    /// Stops the running turn, if any. Partial output stays in place and a
    /// single "stopped" notice is appended. Returns whether a turn was live.
    pub async fn cancel_generation(&self) -> bool {
        let stopped = {
            let mut store = self.store.lock().await;
            store.cancel_active(&self.config.stopped_message)
        };
        if stopped {
            info!("generation stopped by user");
            self.engine.cancel();
            self.cancel_signal.notify_waiters();
        }
        stopped
    }

    async fn run_rounds(
        &self,
        plan: TurnPlan,
        mut pending_context: Option<Value>,
    ) -> Result<TurnOutcome, ChatError> {
        let mut rounds = 0u32;

        loop {
            if rounds as usize >= self.config.max_tool_rounds {
                warn!(
                    limit = self.config.max_tool_rounds,
                    "tool loop did not settle"
                );
                let err = ChatError::ToolRoundLimit(self.config.max_tool_rounds);
                return self.fail(&plan, err, rounds).await;
            }

            let (token, request) = {
                let mut store = self.store.lock().await;
                let Ok(token) = store.open_round(plan.turn) else {
                    return Ok(cancelled(plan.token_estimate, rounds));
                };
                let request = ChatRequest {
                    model: plan.model.clone(),
                    messages: outbound_messages(
                        store.messages(),
                        plan.capabilities.vision,
                        self.config.system_prompt.as_deref(),
                    ),
                    context: pending_context.take(),
                    tools: plan.tools.clone(),
                };
                (token, request)
            };
            rounds += 1;
            debug!(
                round = token.round,
                messages = request.messages.len(),
                "requesting"
            );

            let calls = match self.stream_round(&token, request).await {
                RoundEnd::Interrupted => return Ok(cancelled(plan.token_estimate, rounds)),
                RoundEnd::Failed(err) => return self.fail(&plan, err, rounds).await,
                RoundEnd::Completed => None,
                RoundEnd::ToolCalls(_) if plan.tools.is_none() => {
                    warn!(
                        round = token.round,
                        "ignoring tool calls; tools were not offered"
                    );
                    None
                }
                RoundEnd::ToolCalls(calls) => Some(calls),
            };

            let mut store = self.store.lock().await;
            if store.close_round(&token).is_err() {
                return Ok(cancelled(plan.token_estimate, rounds));
            }

            let Some(calls) = calls else {
                if store.end_turn(plan.turn).is_err() {
                    return Ok(cancelled(plan.token_estimate, rounds));
                }
                info!(rounds, "chat turn completed");
                return Ok(TurnOutcome {
                    status: TurnStatus::Completed,
                    token_estimate: plan.token_estimate,
                    rounds,
                });
            };

            let pending = TurnPhase::ToolsPending(token.round);
            if store.set_phase(plan.turn, pending).is_err() {
                return Ok(cancelled(plan.token_estimate, rounds));
            }
            drop(store);

            if !self.execute_tool_batch(plan.turn, token.round, calls).await {
                return Ok(cancelled(plan.token_estimate, rounds));
            }
        }
    }

    async fn stream_round(&self, token: &RoundToken, request: ChatRequest) -> RoundEnd {
        // Registered before the liveness check so a cancel in between is
        // still observed.
        let cancel_requested = self.cancel_signal.notified();
        tokio::pin!(cancel_requested);

        if !self.store.lock().await.is_round_current(token) {
            return RoundEnd::Interrupted;
        }

        let mut stream = tokio::select! {
            _ = &mut cancel_requested => return RoundEnd::Interrupted,
            submitted = self.engine.submit_chat(request) => match submitted {
                Ok(stream) => stream,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(error = %message, "chat request failed");
                    return RoundEnd::Failed(ChatError::classify(&message));
                }
            },
        };

        let mut batch: Option<Vec<ToolCallRequest>> = None;
        let mut streamed_text = false;
        loop {
            let event = tokio::select! {
                _ = &mut cancel_requested => return RoundEnd::Interrupted,
                event = stream.next() => event,
            };

            match event {
                None | Some(EngineEvent::Settled) => break,
                Some(EngineEvent::Token(text)) => {
                    if self.store.lock().await.append_token(token, &text).is_err() {
                        return RoundEnd::Interrupted;
                    }
                    streamed_text = true;
                }
                Some(EngineEvent::Reasoning(text)) => {
                    if self.store.lock().await.append_reasoning(token, &text).is_err() {
                        return RoundEnd::Interrupted;
                    }
                }
                Some(EngineEvent::ToolCallBatch(calls)) => {
                    if streamed_text {
                        warn!(
                            round = token.round,
                            "engine sent text and tool calls in one round"
                        );
                    }
                    debug!(
                        round = token.round,
                        calls = calls.len(),
                        "tool call batch received"
                    );
                    batch.get_or_insert_with(Vec::new).extend(calls);
                }
                Some(EngineEvent::Failed(message)) => {
                    warn!(error = %message, round = token.round, "engine reported failure");
                    return RoundEnd::Failed(ChatError::classify(&message));
                }
            }
        }

        match batch {
            Some(calls) if !calls.is_empty() => RoundEnd::ToolCalls(calls),
            _ => RoundEnd::Completed,
        }
    }

    /// Runs the batch strictly in order. Returns false once the turn is no
    /// longer live; the in-flight tool call is allowed to finish first.
    async fn execute_tool_batch(
        &self,
        turn: TurnId,
        round: u32,
        calls: Vec<ToolCallRequest>,
    ) -> bool {
        {
            let mut store = self.store.lock().await;
            let executing = TurnPhase::ExecutingTools(round);
            if store.set_phase(turn, executing).is_err() {
                return false;
            }
        }

        for call in calls {
            let announcement = NewMessage::tool_announcement(&call.name, call.arguments.clone());
            let announced = self.store.lock().await.push_for_turn(turn, announcement);
            if announced.is_err() {
                return false;
            }

            info!(tool = %call.name, round, "running tool");
            let result = self.tools.execute_tool(&call.name, call.arguments).await;

            let recorded = self
                .store
                .lock()
                .await
                .push_for_turn(turn, NewMessage::tool_output(result));
            if recorded.is_err() {
                return false;
            }
        }
        true
    }

    async fn fail(
        &self,
        plan: &TurnPlan,
        err: ChatError,
        rounds: u32,
    ) -> Result<TurnOutcome, ChatError> {
        let recorded = self
            .store
            .lock()
            .await
            .fail_turn(plan.turn, &err.user_message());
        if recorded {
            Err(err)
        } else {
            // Cancelled or cleared while the failure was in flight.
            Ok(cancelled(plan.token_estimate, rounds))
        }
    }
}

fn cancelled(token_estimate: Option<usize>, rounds: u32) -> TurnOutcome {
    TurnOutcome {
        status: TurnStatus::Cancelled,
        token_estimate,
        rounds,
    }
}

fn context_info(ctx: &OptimizedContext, page: &PageCapture, sent_to_model: bool) -> ContextInfo {
    ContextInfo {
        url: page.url.clone(),
        has_screenshot: page.has_screenshot(),
        has_selected_text: page.has_selected_text(),
        page_content_chars: ctx.page.content.chars().count(),
        history_items: ctx.history.len(),
        bookmark_items: ctx.bookmarks.len(),
        estimated_tokens: ctx.estimated_tokens,
        profile: ctx.profile,
        sent_to_model,
    }
}

/// Model-facing history: drops empty assistant slots, orchestrator notices,
/// and tool announcements. Tool results are kept.
pub fn outbound_messages(
    messages: &[Message],
    include_images: bool,
    system_prompt: Option<&str>,
) -> Vec<EngineMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
        out.push(EngineMessage::new(EngineRole::System, prompt));
    }

    for message in messages {
        if message.is_tool_execution {
            continue;
        }
        let role = match message.role {
            Role::User => EngineRole::User,
            Role::Tool => EngineRole::Tool,
            Role::Assistant => {
                if message.notice.is_some() || message.content.trim().is_empty() {
                    continue;
                }
                EngineRole::Assistant
            }
        };

        let mut outbound = EngineMessage::new(role, message.content.clone());
        if include_images && role == EngineRole::User {
            outbound.images = message.images.clone();
        }
        outbound.tool_name = message.tool_result.as_ref().map(|r| r.name.clone());
        out.push(outbound);
    }
    out
}

pub struct TurnOrchestratorBuilder {
    engine: Arc<dyn InferenceEngine>,
    store: SharedConversation,
    tools: ToolRegistry,
    models: ModelRegistry,
    context_builder: Option<ContextBuilder>,
    config: AssistantConfig,
}

impl TurnOrchestratorBuilder {
    fn new(engine: Arc<dyn InferenceEngine>, store: SharedConversation) -> Self {
        Self {
            engine,
            store,
            tools: ToolRegistry::new(),
            models: ModelRegistry::with_builtin_models(),
            context_builder: None,
            config: AssistantConfig::default(),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_models(mut self, models: ModelRegistry) -> Self {
        self.models = models;
        self
    }

    pub fn with_config(mut self, config: AssistantConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        let builder = self.context_builder.take().unwrap_or_default();
        self.context_builder = Some(builder.with_estimator(estimator));
        self
    }

    pub fn build(self) -> TurnOrchestrator {
        let context_builder = self
            .context_builder
            .unwrap_or_default()
            .with_selected_text_limit(self.config.selected_text_limit);
        TurnOrchestrator {
            engine: self.engine,
            tools: self.tools,
            models: self.models,
            context_builder,
            store: self.store,
            config: self.config,
            cancel_signal: Notify::new(),
        }
    }
}
