use async_trait::async_trait;
use futures::stream::{self, Stream};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::action::{normalize, NormalizedAction, Point};
use crate::cua::{
    ActionRequest, ComputerTool, Environment, ImageOutput, InputItem, ModelClient, OutputItem,
    ReasoningOptions, ResponseId, ResponseRequest,
};
use crate::safety::{acknowledge_all, SafetyPolicy, UrlGuard};

pub const ERROR_PREFIX: &str = "An error occurred: Error during conversation: ";
pub const STOPPED_MESSAGE: &str = "Conversation stopped by user.";
pub const STOP_NOTICE: &str = "Operation stopped by user. No further actions required until user input.";

pub const DESKTOP_INSTRUCTIONS: &str = "\
You control a Linux desktop running in a container through mouse and keyboard actions.
Firefox ESR is the default browser; GUI applications may take time to load, so take extra screenshots when needed.
To enter text, click the field first, then type; use keypress for special keys such as ENTER or ESC.
Scroll through long pages and documents before drawing conclusions.
Work autonomously: do not ask for confirmation of routine steps, and make reasonable assumptions when a task is ambiguous.
Only ask the user for input that cannot be inferred, such as passwords or personal preferences.
If an approach fails, try an alternative before reporting failure, and report final results concisely.";

// ========================= Core Types =========================

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("remote call failed: {0}")]
    RemoteCall(String),
    #[error("action normalization failed: {0}")]
    Normalization(String),
    #[error("action execution failed: {0}")]
    Execution(String),
    #[error("Safety check failed: {0}. Cannot continue with unacknowledged safety checks.")]
    SafetyRefusal(String),
    #[error("blocked by policy: {0}")]
    PolicyViolation(String),
    #[error("environment provisioning failed: {0}")]
    Provisioning(String),
}

/// Events yielded to the caller while a submission runs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnEvent {
    AssistantMessage { content: String },
    ReasoningNote { content: String },
    ActionTaken { kind: String, parameters: Value },
}

impl TurnEvent {
    fn assistant(content: impl Into<String>) -> Self {
        TurnEvent::AssistantMessage { content: content.into() }
    }

    fn failure(err: &AgentError) -> Self {
        TurnEvent::assistant(format!("{ERROR_PREFIX}{err}"))
    }
}

/// Per-conversation state; the caller owns it and lends it to each submission.
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    pub last_response_id: Option<ResponseId>,
    pub pending: Vec<InputItem>,
}

impl ConversationState {
    pub fn reset(&mut self) {
        self.last_response_id = None;
        self.pending.clear();
    }
}

/// Outcome of one executed action, before it is sent back to the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionResult {
    pub call_id: String,
    pub screenshot: String,
    pub acknowledged: Vec<crate::cua::SafetyCheck>,
    pub current_url: Option<String>,
}

impl ActionResult {
    fn into_input(self) -> InputItem {
        InputItem::computer_call_output(
            self.call_id,
            self.acknowledged,
            ImageOutput::png(&self.screenshot, self.current_url),
        )
    }
}

// ========================= Pluggable Subsystems =========================

/// A controllable target machine. Mutating calls return once the input is delivered.
#[async_trait]
pub trait Computer: Send + Sync {
    fn environment(&self) -> Environment;
    fn dimensions(&self) -> (u32, u32);

    /// Base64 PNG of the current display.
    async fn screenshot(&self) -> Result<String, AgentError>;
    async fn click(&self, x: i64, y: i64, button: &str) -> Result<(), AgentError>;
    async fn double_click(&self, x: i64, y: i64) -> Result<(), AgentError>;
    async fn type_text(&self, text: &str) -> Result<(), AgentError>;
    async fn keypress(&self, keys: &[String]) -> Result<(), AgentError>;
    async fn scroll(&self, x: i64, y: i64, scroll_x: i64, scroll_y: i64) -> Result<(), AgentError>;
    async fn drag(&self, path: &[Point]) -> Result<(), AgentError>;
    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), AgentError>;

    async fn wait(&self, ms: u64) -> Result<(), AgentError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    /// Page address for browser-capable computers.
    async fn current_url(&self) -> Result<Option<String>, AgentError> {
        Ok(None)
    }
}

#[async_trait]
impl<T: Computer + ?Sized> Computer for &T {
    fn environment(&self) -> Environment {
        (**self).environment()
    }
    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }
    async fn screenshot(&self) -> Result<String, AgentError> {
        (**self).screenshot().await
    }
    async fn click(&self, x: i64, y: i64, button: &str) -> Result<(), AgentError> {
        (**self).click(x, y, button).await
    }
    async fn double_click(&self, x: i64, y: i64) -> Result<(), AgentError> {
        (**self).double_click(x, y).await
    }
    async fn type_text(&self, text: &str) -> Result<(), AgentError> {
        (**self).type_text(text).await
    }
    async fn keypress(&self, keys: &[String]) -> Result<(), AgentError> {
        (**self).keypress(keys).await
    }
    async fn scroll(&self, x: i64, y: i64, scroll_x: i64, scroll_y: i64) -> Result<(), AgentError> {
        (**self).scroll(x, y, scroll_x, scroll_y).await
    }
    async fn drag(&self, path: &[Point]) -> Result<(), AgentError> {
        (**self).drag(path).await
    }
    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), AgentError> {
        (**self).move_mouse(x, y).await
    }
    async fn wait(&self, ms: u64) -> Result<(), AgentError> {
        (**self).wait(ms).await
    }
    async fn current_url(&self) -> Result<Option<String>, AgentError> {
        (**self).current_url().await
    }
}

// ========================= Engine =========================

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub model: String,
    pub settle_delay: Duration,
    pub reasoning_summary: String,
    pub truncation: String,
    pub instructions: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: std::env::var("OPENAI_CUA_MODEL").unwrap_or_else(|_| "computer-use-preview".into()),
            settle_delay: Duration::from_millis(500),
            reasoning_summary: "concise".into(),
            truncation: "auto".into(),
            instructions: None,
        }
    }
}

pub struct ConversationEngine<M, C, P>
where
    M: ModelClient,
    C: Computer,
    P: SafetyPolicy,
{
    client: M,
    computer: C,
    policy: P,
    url_guard: UrlGuard,
    tool: ComputerTool,
    cfg: EngineConfig,
}

impl<M, C, P> ConversationEngine<M, C, P>
where
    M: ModelClient,
    C: Computer,
    P: SafetyPolicy,
{
    /// Captures the computer's dimensions and environment as the model's action space.
    pub fn new(client: M, computer: C, policy: P, cfg: EngineConfig) -> Self {
        let (width, height) = computer.dimensions();
        let tool = ComputerTool::new(width, height, computer.environment());
        Self {
            client,
            computer,
            policy,
            url_guard: UrlGuard::default(),
            tool,
            cfg,
        }
    }

    pub fn with_url_guard(mut self, guard: UrlGuard) -> Self {
        self.url_guard = guard;
        self
    }

    pub fn computer(&self) -> &C {
        &self.computer
    }

    pub fn tool(&self) -> &ComputerTool {
        &self.tool
    }

    /// Runs one user submission. Nothing happens until the stream is polled;
    /// `stop` is checked only after all items of a response are handled.
    pub fn submit<'a>(
        &'a self,
        state: &'a mut ConversationState,
        text: &str,
        stop: CancellationToken,
    ) -> impl Stream<Item = TurnEvent> + Send + 'a
    where
        M: 'a,
        C: 'a,
        P: 'a,
    {
        state.pending.push(InputItem::user(text));
        let span = info_span!("submission", id = %nanoid!(8));
        let turn = Turn {
            engine: self,
            state,
            stop,
            outputs: VecDeque::new(),
            rearm: true,
            phase: Phase::Exchange,
        };
        stream::unfold(turn, move |mut turn| {
            let span = span.clone();
            async move {
                let event = turn.next_event().instrument(span).await?;
                Some((event, turn))
            }
        })
    }

    async fn exchange(&self, state: &mut ConversationState) -> Result<Vec<OutputItem>, AgentError> {
        let request = ResponseRequest {
            model: self.cfg.model.clone(),
            previous_response_id: state.last_response_id.clone(),
            tools: vec![self.tool.clone()],
            input: state.pending.clone(),
            reasoning: ReasoningOptions { generate_summary: self.cfg.reasoning_summary.clone() },
            truncation: self.cfg.truncation.clone(),
            instructions: self.cfg.instructions.clone(),
        };
        let response = self.client.create(&request).await?;
        state.last_response_id = Some(response.id);
        state.pending.clear();
        if response.output.is_empty() {
            return Err(AgentError::RemoteCall("No output from model".into()));
        }
        debug!(items = response.output.len(), "model response");
        Ok(response.output)
    }

    /// Normalizes, executes and screenshots one action request.
    async fn handle(&self, request: ActionRequest) -> Result<(NormalizedAction, ActionResult), AgentError> {
        let action = normalize(&request)?;
        info!(kind = action.kind(), call_id = %request.call_id, "executing action");
        self.dispatch(&action).await?;
        if !matches!(action, NormalizedAction::Wait { .. }) {
            tokio::time::sleep(self.cfg.settle_delay).await;
        }
        let screenshot = self.computer.screenshot().await?;

        acknowledge_all(&self.policy, &request.pending_safety_checks).await?;

        let current_url = if self.computer.environment() == Environment::Browser {
            let url = self.computer.current_url().await?;
            if let Some(url) = &url {
                self.url_guard.check(url)?;
            }
            url
        } else {
            None
        };

        Ok((
            action,
            ActionResult {
                call_id: request.call_id,
                screenshot,
                acknowledged: request.pending_safety_checks,
                current_url,
            },
        ))
    }

    async fn dispatch(&self, action: &NormalizedAction) -> Result<(), AgentError> {
        let c = &self.computer;
        match action {
            NormalizedAction::Click { x, y, button } => c.click(*x, *y, button).await,
            NormalizedAction::DoubleClick { x, y } => c.double_click(*x, *y).await,
            NormalizedAction::Type { text } => c.type_text(text).await,
            NormalizedAction::Keypress { keys } => c.keypress(keys).await,
            NormalizedAction::Scroll { x, y, scroll_x, scroll_y } => c.scroll(*x, *y, *scroll_x, *scroll_y).await,
            NormalizedAction::Drag { path } => c.drag(path).await,
            NormalizedAction::Move { x, y } => c.move_mouse(*x, *y).await,
            NormalizedAction::Wait { ms } => c.wait(*ms).await,
            NormalizedAction::Screenshot => Ok(()),
        }
    }

    async fn flush(&self, state: &mut ConversationState) {
        state.pending.push(InputItem::user(STOP_NOTICE));
        if let Err(err) = self.exchange(state).await {
            warn!(error = %err, "flushing pending items failed");
        }
        state.pending.clear();
    }
}

enum Phase {
    Exchange,
    Draining,
    Finished,
}

struct Turn<'a, M, C, P>
where
    M: ModelClient,
    C: Computer,
    P: SafetyPolicy,
{
    engine: &'a ConversationEngine<M, C, P>,
    state: &'a mut ConversationState,
    stop: CancellationToken,
    outputs: VecDeque<OutputItem>,
    rearm: bool,
    phase: Phase,
}

impl<M, C, P> Turn<'_, M, C, P>
where
    M: ModelClient,
    C: Computer,
    P: SafetyPolicy,
{
    async fn next_event(&mut self) -> Option<TurnEvent> {
        loop {
            match self.phase {
                Phase::Finished => return None,
                Phase::Exchange => match self.engine.exchange(self.state).await {
                    Ok(items) => {
                        self.outputs = items.into();
                        self.rearm = false;
                        self.phase = Phase::Draining;
                    }
                    Err(err) => return Some(self.abort(err)),
                },
                Phase::Draining => {
                    if let Some(item) = self.outputs.pop_front() {
                        match item {
                            OutputItem::Message { text } => return Some(TurnEvent::assistant(text)),
                            OutputItem::Reasoning { summary } => {
                                return Some(TurnEvent::ReasoningNote { content: summary.join("\n") });
                            }
                            OutputItem::ComputerCall(request) => match self.engine.handle(request).await {
                                Ok((action, result)) => {
                                    self.state.pending.push(result.into_input());
                                    self.rearm = true;
                                    return Some(TurnEvent::ActionTaken {
                                        kind: action.kind().to_string(),
                                        parameters: action.parameters(),
                                    });
                                }
                                Err(err) => return Some(self.abort(err)),
                            },
                        }
                    }
                    if self.stop.is_cancelled() {
                        info!("stop requested, flushing pending items");
                        self.engine.flush(self.state).await;
                        self.phase = Phase::Finished;
                        return Some(TurnEvent::assistant(STOPPED_MESSAGE));
                    }
                    if !self.rearm {
                        self.phase = Phase::Finished;
                        return None;
                    }
                    self.phase = Phase::Exchange;
                }
            }
        }
    }

    fn abort(&mut self, err: AgentError) -> TurnEvent {
        warn!(error = %err, "conversation aborted");
        self.state.pending.clear();
        self.outputs.clear();
        self.phase = Phase::Finished;
        TurnEvent::failure(&err)
    }
}
