pub mod action;
pub mod agent;
pub mod browser;
pub mod cua;
pub mod docker;
pub mod safety;

pub use action::{normalize, NormalizedAction, Point};
pub use agent::{AgentError, Computer, ConversationEngine, ConversationState, EngineConfig, TurnEvent};
pub use browser::{BrowserConfig, ChromiumComputer};
pub use cua::{CuaClient, CuaConfig, Environment, ModelClient};
pub use docker::{DockerComputer, DockerConfig, SessionState};
pub use safety::{AutoApprove, SafetyPolicy, UrlGuard};
