use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::agent::AgentError;

#[derive(Clone)]
pub struct CuaConfig {
    pub api_base: String,      // e.g. "https://api.openai.com/v1"
    pub api_key: String,       // env OPENAI_API_KEY
    pub timeout: Duration,
}

impl Default for CuaConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Opaque handle of a completed turn, threaded into the next request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Browser,
    Linux,
    Mac,
    Windows,
    Ubuntu,
}

/// Hosted computer tool declaration; fixes the model's action space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComputerTool {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub display_width: u32,
    pub display_height: u32,
    pub environment: Environment,
}

impl ComputerTool {
    pub fn new(width: u32, height: u32, environment: Environment) -> Self {
        Self { kind: "computer_use_preview", display_width: width, display_height: height, environment }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageOutput {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
}

impl ImageOutput {
    pub fn png(data_base64: &str, current_url: Option<String>) -> Self {
        Self {
            kind: "input_image",
            image_url: format!("data:image/png;base64,{data_base64}"),
            current_url,
        }
    }
}

/// Items the engine sends back to the model.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InputItem {
    User { role: &'static str, content: String },
    ComputerCallOutput {
        #[serde(rename = "type")]
        kind: &'static str,
        call_id: String,
        acknowledged_safety_checks: Vec<SafetyCheck>,
        output: ImageOutput,
    },
}

impl InputItem {
    pub fn user(text: impl Into<String>) -> Self {
        InputItem::User { role: "user", content: text.into() }
    }

    pub fn computer_call_output(call_id: String, acknowledged: Vec<SafetyCheck>, output: ImageOutput) -> Self {
        InputItem::ComputerCallOutput {
            kind: "computer_call_output",
            call_id,
            acknowledged_safety_checks: acknowledged,
            output,
        }
    }

    /// Copy suitable for logs: screenshot payloads are replaced by a marker.
    pub fn sanitized(&self) -> Self {
        match self {
            InputItem::ComputerCallOutput { kind, call_id, acknowledged_safety_checks, output } => {
                InputItem::ComputerCallOutput {
                    kind: *kind,
                    call_id: call_id.clone(),
                    acknowledged_safety_checks: acknowledged_safety_checks.clone(),
                    output: ImageOutput { image_url: "[omitted]".into(), ..output.clone() },
                }
            }
            other => other.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReasoningOptions {
    pub generate_summary: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<ResponseId>,
    pub tools: Vec<ComputerTool>,
    pub input: Vec<InputItem>,
    pub reasoning: ReasoningOptions,
    pub truncation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A model-emitted request to perform one primitive interaction.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionRequest {
    pub call_id: String,
    pub kind: ActionKind,
    pub raw: Value,
    pub pending_safety_checks: Vec<SafetyCheck>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Click,
    DoubleClick,
    Type,
    Keypress,
    Scroll,
    Drag,
    Move,
    Wait,
    Screenshot,
    Unknown(String),
}

impl ActionKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "click" => ActionKind::Click,
            "double_click" => ActionKind::DoubleClick,
            "type" => ActionKind::Type,
            "keypress" => ActionKind::Keypress,
            "scroll" => ActionKind::Scroll,
            "drag" => ActionKind::Drag,
            "move" => ActionKind::Move,
            "wait" => ActionKind::Wait,
            "screenshot" => ActionKind::Screenshot,
            other => ActionKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::Type => "type",
            ActionKind::Keypress => "keypress",
            ActionKind::Scroll => "scroll",
            ActionKind::Drag => "drag",
            ActionKind::Move => "move",
            ActionKind::Wait => "wait",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Unknown(name) => name,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputItem {
    Message { text: String },
    Reasoning { summary: Vec<String> },
    ComputerCall(ActionRequest),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub id: ResponseId,
    pub output: Vec<OutputItem>,
}

// Wire shapes of the Responses API output, decoded once and mapped to `OutputItem`.
#[derive(Deserialize)]
struct RawResponse {
    id: ResponseId,
    #[serde(default)]
    output: Vec<RawItem>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawItem {
    Message {
        #[serde(default)]
        content: Vec<RawText>,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<RawText>,
    },
    ComputerCall {
        call_id: String,
        #[serde(default)]
        action: Value,
        #[serde(default)]
        pending_safety_checks: Vec<SafetyCheck>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct RawText {
    #[serde(default)]
    text: String,
}

/// Transport to the remote reasoning model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn create(&self, request: &ResponseRequest) -> Result<ModelResponse, AgentError>;
}

#[derive(Clone)]
pub struct CuaClient {
    http: Client,
    cfg: CuaConfig,
}

impl CuaClient {
    pub fn new(cfg: CuaConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, cfg })
    }

    async fn post(&self, request: &ResponseRequest) -> Result<ModelResponse> {
        let url = format!("{}/responses", self.cfg.api_base);
        if tracing::enabled!(tracing::Level::DEBUG) {
            let logged: Vec<InputItem> = request.input.iter().map(InputItem::sanitized).collect();
            debug!(model = %request.model, previous = ?request.previous_response_id, input = ?logged, "responses request");
        }
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(request)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("OpenAI error {}: {}", status, text);
        }
        parse_response(&text)
    }
}

#[async_trait]
impl ModelClient for CuaClient {
    async fn create(&self, request: &ResponseRequest) -> Result<ModelResponse, AgentError> {
        self.post(request)
            .await
            .map_err(|e| AgentError::RemoteCall(format!("{e:#}")))
    }
}

pub fn parse_response(text: &str) -> Result<ModelResponse> {
    let raw: RawResponse = serde_json::from_str(text).context("failed to parse OpenAI response JSON")?;
    let mut output = Vec::with_capacity(raw.output.len());
    for item in raw.output {
        match item {
            RawItem::Message { content } => {
                let text = content.into_iter().map(|c| c.text).collect::<Vec<_>>().join("");
                output.push(OutputItem::Message { text });
            }
            RawItem::Reasoning { summary } => {
                output.push(OutputItem::Reasoning { summary: summary.into_iter().map(|s| s.text).collect() });
            }
            RawItem::ComputerCall { call_id, action, pending_safety_checks } => {
                let kind = action.get("type").and_then(Value::as_str).unwrap_or("unknown");
                output.push(OutputItem::ComputerCall(ActionRequest {
                    call_id,
                    kind: ActionKind::parse(kind),
                    raw: action,
                    pending_safety_checks,
                }));
            }
            RawItem::Other => debug!("skipping unrecognized output item"),
        }
    }
    Ok(ModelResponse { id: raw.id, output })
}
