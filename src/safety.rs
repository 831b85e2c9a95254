use async_trait::async_trait;
use tracing::warn;
use url::Url;

use crate::agent::AgentError;
use crate::cua::SafetyCheck;

pub const DEFAULT_BLOCKED_DOMAINS: [&str; 6] = [
    "maliciousbook.com",
    "evilvideos.com",
    "darkwebforum.com",
    "shadytok.com",
    "suspiciouspins.com",
    "ilanbigio.com",
];

const NO_MESSAGE: &str = "Safety check with no message";

/// Decides whether a model-flagged safety check may be acknowledged.
#[async_trait]
pub trait SafetyPolicy: Send + Sync {
    async fn acknowledge(&self, message: &str) -> bool;
}

#[async_trait]
impl<F> SafetyPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    async fn acknowledge(&self, message: &str) -> bool {
        self(message)
    }
}

/// Approves every check. Each one is still logged.
#[derive(Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl SafetyPolicy for AutoApprove {
    async fn acknowledge(&self, message: &str) -> bool {
        warn!(message, "auto-approving safety check");
        true
    }
}

/// Runs every pending check through the policy; the first refusal aborts.
pub async fn acknowledge_all<P: SafetyPolicy + ?Sized>(policy: &P, checks: &[SafetyCheck]) -> Result<(), AgentError> {
    for check in checks {
        let message = check.message.as_deref().unwrap_or(NO_MESSAGE);
        if !policy.acknowledge(message).await {
            return Err(AgentError::SafetyRefusal(message.to_string()));
        }
    }
    Ok(())
}

/// Blocklist applied to the page address after each browser action.
#[derive(Clone, Debug)]
pub struct UrlGuard {
    blocked: Vec<String>,
}

impl Default for UrlGuard {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_DOMAINS)
    }
}

impl UrlGuard {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: domains.into_iter().map(|d| d.into().to_ascii_lowercase()).collect(),
        }
    }

    /// Fails when the host equals a blocked domain or is one of its subdomains.
    pub fn check(&self, url: &str) -> Result<(), AgentError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        if host.is_empty() {
            return Ok(());
        }
        let hit = self
            .blocked
            .iter()
            .any(|blocked| host == *blocked || host.ends_with(&format!(".{blocked}")));
        if hit {
            return Err(AgentError::PolicyViolation(format!("Blocked URL: {url}")));
        }
        Ok(())
    }
}
