use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

use crate::action::Point;
use crate::agent::{AgentError, Computer};
use crate::cua::Environment;

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub start_url: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: (1280, 800),
            start_url: "about:blank".into(),
        }
    }
}

/// Chromium page driven over the DevTools protocol.
pub struct ChromiumComputer {
    page: Page,
    viewport: (u32, u32),
    _browser: OxideBrowser,
    _handler: JoinHandle<()>,
}

impl ChromiumComputer {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per launch avoids Chromium's profile lock on quick restarts.
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("glass-desk-profile-{}-{}", std::process::id(), nanoid::nanoid!(6)));
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        let handle = tokio::spawn(async move { while handler.next().await.is_some() {} });
        let page = browser.new_page(cfg.start_url.as_str()).await?;
        Self::prepare(page, browser, handle, &cfg).await
    }

    /// Attaches to a running Chromium through its DevTools websocket URL.
    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        let handle = tokio::spawn(async move { while handler.next().await.is_some() {} });
        let page = match browser.pages().await?.into_iter().next() {
            Some(page) => page,
            None => browser.new_page(cfg.start_url.as_str()).await?,
        };
        Self::prepare(page, browser, handle, &cfg).await
    }

    async fn prepare(page: Page, browser: OxideBrowser, handle: JoinHandle<()>, cfg: &BrowserConfig) -> Result<Self> {
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await?;
        }
        let computer = Self { page, viewport: cfg.viewport, _browser: browser, _handler: handle };
        computer.apply_viewport().await?;
        Ok(computer)
    }

    // Screenshots fail with "0 width" until a viewport is set explicitly.
    async fn apply_viewport(&self) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    async fn mouse(&self, kind: DispatchMouseEventType, x: i64, y: i64, button: MouseButton, clicks: i64) -> Result<()> {
        let buttons = if kind == DispatchMouseEventType::MouseReleased { 0 } else { button_mask(&button) };
        let params = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x as f64)
            .y(y as f64)
            .button(button)
            .buttons(buttons)
            .click_count(clicks)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn press_release(&self, x: i64, y: i64, button: MouseButton, clicks: i64) -> Result<()> {
        self.page.move_mouse(CdpPoint { x: x as f64, y: y as f64 }).await?;
        self.mouse(DispatchMouseEventType::MousePressed, x, y, button.clone(), clicks).await?;
        self.mouse(DispatchMouseEventType::MouseReleased, x, y, button, clicks).await
    }

    async fn key(&self, kind: DispatchKeyEventType, key: &DomKey, modifiers: i64) -> Result<()> {
        let mut params = DispatchKeyEventParams::builder()
            .r#type(kind.clone())
            .key(key.key.clone())
            .code(key.code.clone())
            .windows_virtual_key_code(key.vk)
            .modifiers(modifiers);
        if kind == DispatchKeyEventType::KeyDown {
            if let Some(text) = &key.text {
                params = params.text(text.clone());
            }
        }
        self.page.execute(params.build().map_err(|e| anyhow!(e))?).await?;
        Ok(())
    }

    async fn chord(&self, keys: &[String]) -> Result<()> {
        let mapped: Vec<DomKey> = keys.iter().map(|k| dom_key(k)).collect();
        let modifiers = mapped.iter().map(|k| k.modifier).fold(0, |acc, m| acc | m);
        for k in &mapped {
            self.key(DispatchKeyEventType::KeyDown, k, modifiers).await?;
        }
        for k in mapped.iter().rev() {
            self.key(DispatchKeyEventType::KeyUp, k, modifiers).await?;
        }
        Ok(())
    }

    async fn type_lines(&self, text: &str) -> Result<()> {
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                self.chord(&["ENTER".to_string()]).await?;
            }
            if !line.is_empty() {
                self.page.execute(InsertTextParams::new(line)).await?;
            }
        }
        Ok(())
    }

    async fn wheel(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<()> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x as f64)
            .y(y as f64)
            .delta_x(dx as f64)
            .delta_y(dy as f64)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn drag_path(&self, path: &[Point]) -> Result<()> {
        let Some((start, rest)) = path.split_first() else {
            return Ok(());
        };
        self.page.move_mouse(CdpPoint { x: start.x as f64, y: start.y as f64 }).await?;
        self.mouse(DispatchMouseEventType::MousePressed, start.x, start.y, MouseButton::Left, 1).await?;
        for p in rest {
            self.mouse(DispatchMouseEventType::MouseMoved, p.x, p.y, MouseButton::Left, 0).await?;
        }
        let end = rest.last().unwrap_or(start);
        self.mouse(DispatchMouseEventType::MouseReleased, end.x, end.y, MouseButton::Left, 1).await
    }

    async fn capture(&self) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder().format(CaptureScreenshotFormat::Png).build();
        Ok(self.page.screenshot(params).await?)
    }
}

fn exec_err(e: anyhow::Error) -> AgentError {
    AgentError::Execution(format!("{e:#}"))
}

#[async_trait]
impl Computer for ChromiumComputer {
    fn environment(&self) -> Environment {
        Environment::Browser
    }

    fn dimensions(&self) -> (u32, u32) {
        self.viewport
    }

    async fn screenshot(&self) -> Result<String, AgentError> {
        let bytes = match self.capture().await {
            Ok(bytes) => bytes,
            Err(e) if needs_viewport_reset(&e) => {
                // Force the viewport and retry once
                if let Err(e) = self.apply_viewport().await {
                    warn!(error = %e, "viewport reset failed");
                }
                sleep(Duration::from_millis(50)).await;
                match self.capture().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "screenshot failed after viewport reset");
                        return Ok(String::new());
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "screenshot failed");
                return Ok(String::new());
            }
        };
        Ok(STANDARD.encode(bytes))
    }

    async fn click(&self, x: i64, y: i64, button: &str) -> Result<(), AgentError> {
        self.press_release(x, y, mouse_button(button), 1).await.map_err(exec_err)
    }

    async fn double_click(&self, x: i64, y: i64) -> Result<(), AgentError> {
        self.press_release(x, y, MouseButton::Left, 1).await.map_err(exec_err)?;
        self.press_release(x, y, MouseButton::Left, 2).await.map_err(exec_err)
    }

    async fn type_text(&self, text: &str) -> Result<(), AgentError> {
        self.type_lines(text).await.map_err(exec_err)
    }

    async fn keypress(&self, keys: &[String]) -> Result<(), AgentError> {
        self.chord(keys).await.map_err(exec_err)
    }

    async fn scroll(&self, x: i64, y: i64, scroll_x: i64, scroll_y: i64) -> Result<(), AgentError> {
        self.page
            .move_mouse(CdpPoint { x: x as f64, y: y as f64 })
            .await
            .map_err(|e| exec_err(e.into()))?;
        self.wheel(x, y, scroll_x, scroll_y).await.map_err(exec_err)
    }

    async fn drag(&self, path: &[Point]) -> Result<(), AgentError> {
        self.drag_path(path).await.map_err(exec_err)
    }

    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), AgentError> {
        self.page
            .move_mouse(CdpPoint { x: x as f64, y: y as f64 })
            .await
            .map_err(|e| exec_err(e.into()))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>, AgentError> {
        self.page.url().await.map_err(|e| exec_err(e.into()))
    }
}

// Chromium reports a collapsed viewport as "0 width" or "0 height".
fn needs_viewport_reset(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("0 width") || msg.contains("0 height")
}

fn mouse_button(name: &str) -> MouseButton {
    match name {
        "right" => MouseButton::Right,
        "middle" | "wheel" => MouseButton::Middle,
        "back" => MouseButton::Back,
        "forward" => MouseButton::Forward,
        _ => MouseButton::Left,
    }
}

fn button_mask(button: &MouseButton) -> i64 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Right => 2,
        MouseButton::Middle => 4,
        MouseButton::Back => 8,
        MouseButton::Forward => 16,
        _ => 0,
    }
}

/// DOM key description for one logical key name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomKey {
    pub key: String,
    pub code: String,
    pub vk: i64,
    pub text: Option<String>,
    /// CDP modifier bit (Alt=1, Ctrl=2, Meta=4, Shift=8); 0 for other keys.
    pub modifier: i64,
}

pub fn dom_key(name: &str) -> DomKey {
    let named = |key: &str, code: &str, vk: i64, modifier: i64| DomKey {
        key: key.into(),
        code: code.into(),
        vk,
        text: None,
        modifier,
    };
    match name.to_ascii_uppercase().as_str() {
        "ENTER" | "RETURN" => DomKey { text: Some("\r".into()), ..named("Enter", "Enter", 13, 0) },
        "TAB" => named("Tab", "Tab", 9, 0),
        "ESC" | "ESCAPE" => named("Escape", "Escape", 27, 0),
        "SPACE" => DomKey { text: Some(" ".into()), ..named(" ", "Space", 32, 0) },
        "BACKSPACE" => named("Backspace", "Backspace", 8, 0),
        "DELETE" => named("Delete", "Delete", 46, 0),
        "LEFT" | "ARROWLEFT" => named("ArrowLeft", "ArrowLeft", 37, 0),
        "UP" | "ARROWUP" => named("ArrowUp", "ArrowUp", 38, 0),
        "RIGHT" | "ARROWRIGHT" => named("ArrowRight", "ArrowRight", 39, 0),
        "DOWN" | "ARROWDOWN" => named("ArrowDown", "ArrowDown", 40, 0),
        "HOME" => named("Home", "Home", 36, 0),
        "END" => named("End", "End", 35, 0),
        "PAGEUP" => named("PageUp", "PageUp", 33, 0),
        "PAGEDOWN" => named("PageDown", "PageDown", 34, 0),
        "ALT" | "OPTION" => named("Alt", "AltLeft", 18, 1),
        "CTRL" | "CONTROL" => named("Control", "ControlLeft", 17, 2),
        "META" | "SUPER" | "CMD" | "WIN" => named("Meta", "MetaLeft", 91, 4),
        "SHIFT" => named("Shift", "ShiftLeft", 16, 8),
        _ => {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    let upper = c.to_ascii_uppercase();
                    let code = if upper.is_ascii_alphabetic() {
                        format!("Key{upper}")
                    } else if upper.is_ascii_digit() {
                        format!("Digit{upper}")
                    } else {
                        String::new()
                    };
                    DomKey {
                        key: name.into(),
                        code,
                        vk: if upper.is_ascii_alphanumeric() { upper as i64 } else { 0 },
                        text: Some(name.into()),
                        modifier: 0,
                    }
                }
                _ => named(name, name, 0, 0),
            }
        }
    }
}
