use anyhow::Result;
use futures::StreamExt;
use glass_desk::agent::DESKTOP_INSTRUCTIONS;
use glass_desk::{
    AutoApprove, BrowserConfig, ChromiumComputer, ConversationEngine, ConversationState, CuaClient, CuaConfig,
    DockerComputer, DockerConfig, EngineConfig, TurnEvent,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// Usage: cargo run --example quickstart -- "open a terminal and run uname -a"
// Set USE_BROWSER=1 to drive a local Chromium instead of the Docker desktop.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let task = if task.trim().is_empty() { "Take a screenshot and describe the desktop.".to_string() } else { task };

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let client = CuaClient::new(CuaConfig::default())?;
    let mut state = ConversationState::default();

    if std::env::var("USE_BROWSER").is_ok_and(|v| v == "1") {
        let computer = ChromiumComputer::launch(BrowserConfig { headless: false, ..Default::default() }).await?;
        let engine = ConversationEngine::new(client, computer, AutoApprove, EngineConfig::default());
        print_events(engine.submit(&mut state, &task, stop)).await;
        return Ok(());
    }

    let mut desktop = DockerComputer::new(DockerConfig::default());
    {
        let session = desktop.acquire().await?;
        if let Some(url) = session.vnc_url() {
            println!("Watch the desktop at {url}");
        }
        let cfg = EngineConfig { instructions: Some(DESKTOP_INSTRUCTIONS.to_string()), ..Default::default() };
        let engine = ConversationEngine::new(client, &*session, AutoApprove, cfg);
        print_events(engine.submit(&mut state, &task, stop)).await;
    }
    desktop.exit().await?;
    Ok(())
}

async fn print_events(events: impl futures::Stream<Item = TurnEvent>) {
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::AssistantMessage { content } => println!("\n{content}"),
            TurnEvent::ReasoningNote { content } => println!("\n[reasoning] {content}"),
            TurnEvent::ActionTaken { kind, parameters } => println!("\n[action] {kind} {parameters}"),
        }
    }
}
