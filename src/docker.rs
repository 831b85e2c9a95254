//! Linux desktop in a Docker container, driven with `xdotool` over `docker exec`.

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::ops::Deref;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::action::Point;
use crate::agent::{AgentError, Computer};
use crate::cua::Environment;

const PORT_PROBE_ATTEMPTS: u16 = 10;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

// Ports handed out to drivers in this process. Held for the whole probe.
static RESERVED_PORTS: Mutex<BTreeSet<u16>> = Mutex::const_new(BTreeSet::new());

#[derive(Clone, Debug)]
pub struct DockerConfig {
    pub container_name: String,
    pub display: String,
    /// `None` probes forward from 5900.
    pub vnc_port: Option<u16>,
    /// `None` probes forward from 6080.
    pub novnc_port: Option<u16>,
    pub compose_file: String,
    pub compose_project: String,
    pub shutdown_on_exit: bool,
    pub fallback_dimensions: (u32, u32),
    pub health_attempts: u32,
    pub health_backoff: Duration,
    pub startup_grace: Duration,
    pub type_delay: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        let port = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());
        Self {
            container_name: std::env::var("CUA_CONTAINER").unwrap_or_else(|_| "vnc-desktop".into()),
            display: std::env::var("CUA_DISPLAY").unwrap_or_else(|_| ":99".into()),
            vnc_port: port("CUA_VNC_PORT"),
            novnc_port: port("CUA_NOVNC_PORT"),
            compose_file: "docker-compose.yml".into(),
            compose_project: "computer-user-agent".into(),
            shutdown_on_exit: std::env::var("CUA_SHUTDOWN_ON_EXIT")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
            fallback_dimensions: (1280, 720),
            health_attempts: 10,
            health_backoff: Duration::from_secs(2),
            startup_grace: Duration::from_secs(2),
            type_delay: Duration::from_millis(100),
        }
    }
}

/// Out-of-band command execution against the container and its host.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Runs `cmd` through `sh -c` inside the target. Failures are logged and yield "".
    async fn exec(&self, cmd: &str) -> String;

    /// Runs a program on the host, failing on spawn errors or non-zero exit.
    async fn host(&self, program: &str, args: &[&str], env: &[(&str, String)]) -> anyhow::Result<String>;
}

pub struct DockerExec {
    container: String,
}

impl DockerExec {
    pub fn new(container: impl Into<String>) -> Self {
        Self { container: container.into() }
    }
}

#[async_trait]
impl CommandChannel for DockerExec {
    async fn exec(&self, cmd: &str) -> String {
        let output = Command::new("docker")
            .args(["exec", &self.container, "sh", "-c", cmd])
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
            Ok(out) => {
                warn!(
                    cmd,
                    status = ?out.status.code(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "container command failed"
                );
                String::new()
            }
            Err(e) => {
                warn!(cmd, error = %e, "could not run docker exec");
                String::new()
            }
        }
    }

    async fn host(&self, program: &str, args: &[&str], env: &[(&str, String)]) -> anyhow::Result<String> {
        let out = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn {program}"))?;
        if !out.status.success() {
            bail!(
                "{program} {} exited with {}: {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Lifecycle of a [`DockerComputer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Starting,
    Ready,
    InUse,
    Stopped,
}

pub struct DockerComputer<Ch: CommandChannel = DockerExec> {
    cfg: DockerConfig,
    channel: Ch,
    dimensions: (u32, u32),
    state: SessionState,
    vnc_port: Option<u16>,
    novnc_port: Option<u16>,
    reserved: Vec<u16>,
    started_by_us: bool,
}

impl DockerComputer<DockerExec> {
    pub fn new(cfg: DockerConfig) -> Self {
        let channel = DockerExec::new(cfg.container_name.clone());
        Self::with_channel(cfg, channel)
    }
}

impl<Ch: CommandChannel> DockerComputer<Ch> {
    pub fn with_channel(cfg: DockerConfig, channel: Ch) -> Self {
        Self {
            dimensions: cfg.fallback_dimensions,
            vnc_port: cfg.vnc_port,
            novnc_port: cfg.novnc_port,
            cfg,
            channel,
            state: SessionState::Uninitialized,
            reserved: Vec::new(),
            started_by_us: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn ports(&self) -> (Option<u16>, Option<u16>) {
        (self.vnc_port, self.novnc_port)
    }

    /// Browser address of the noVNC viewer, once ports are resolved.
    pub fn vnc_url(&self) -> Option<String> {
        self.novnc_port
            .map(|port| format!("http://localhost:{port}/vnc.html?autoconnect=true&password=secret&resize=local"))
    }

    /// Starts (or attaches to) the container and probes the display geometry.
    pub async fn enter(&mut self) -> Result<(), AgentError> {
        if matches!(self.state, SessionState::Ready | SessionState::InUse) {
            return Ok(());
        }
        self.state = SessionState::Starting;
        match self.start().await {
            Ok(()) => {
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Marks the computer in use until the returned guard is dropped.
    pub async fn acquire(&mut self) -> Result<Session<'_, Ch>, AgentError> {
        self.enter().await?;
        self.state = SessionState::InUse;
        Ok(Session { computer: self })
    }

    /// Tears the container down only if this driver started it and
    /// `shutdown_on_exit` is set.
    pub async fn exit(&mut self) -> Result<(), AgentError> {
        if self.started_by_us && self.cfg.shutdown_on_exit {
            info!(container = %self.cfg.container_name, "stopping container");
            let env = self.compose_env();
            let args = ["-f", self.cfg.compose_file.as_str(), "-p", self.cfg.compose_project.as_str(), "down"];
            self.channel
                .host("docker-compose", &args, &env)
                .await
                .map_err(|e| AgentError::Provisioning(format!("failed to stop container: {e:#}")))?;
            self.started_by_us = false;
        } else if self.started_by_us {
            info!(container = %self.cfg.container_name, "container left running (shutdown_on_exit=false)");
        }
        for port in self.reserved.drain(..) {
            release_port(port).await;
        }
        self.state = SessionState::Stopped;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), AgentError> {
        if self.vnc_port.is_none() {
            let port = find_available_port(5900).await;
            self.reserved.push(port);
            self.vnc_port = Some(port);
        }
        if self.novnc_port.is_none() {
            let port = find_available_port(6080).await;
            self.reserved.push(port);
            self.novnc_port = Some(port);
        }

        if self.is_running().await {
            info!(container = %self.cfg.container_name, "container already running");
        } else {
            self.launch().await?;
        }

        if !self.is_running().await {
            return Err(AgentError::Provisioning(format!(
                "container {name} is not running; check the logs using: docker logs {name}",
                name = self.cfg.container_name
            )));
        }

        sleep(self.cfg.startup_grace).await;
        self.probe_dimensions().await;
        Ok(())
    }

    async fn launch(&mut self) -> Result<(), AgentError> {
        let env = self.compose_env();
        info!(
            container = %self.cfg.container_name,
            vnc_port = ?self.vnc_port,
            novnc_port = ?self.novnc_port,
            "starting container"
        );
        let args = [
            "-f",
            self.cfg.compose_file.as_str(),
            "-p",
            self.cfg.compose_project.as_str(),
            "up",
            "-d",
            "--build",
        ];
        self.channel
            .host("docker-compose", &args, &env)
            .await
            .map_err(|e| AgentError::Provisioning(format!("failed to start container: {e:#}")))?;
        self.started_by_us = true;

        let attempts = self.cfg.health_attempts;
        for attempt in 1..=attempts {
            sleep(self.cfg.health_backoff).await;
            let status = self
                .channel
                .host(
                    "docker",
                    &["inspect", "--format", "{{.State.Health.Status}}", self.cfg.container_name.as_str()],
                    &[],
                )
                .await;
            match status {
                Ok(s) if s.trim() == "healthy" => {
                    info!(container = %self.cfg.container_name, "container healthy");
                    return Ok(());
                }
                Ok(s) => info!(attempt, attempts, status = s.trim(), "waiting for container to be ready"),
                Err(e) => debug!(attempt, attempts, error = %e, "waiting for container to start"),
            }
        }
        warn!(container = %self.cfg.container_name, "health checks exhausted, proceeding anyway");
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let filter = format!("name={}", self.cfg.container_name);
        match self.channel.host("docker", &["ps", "-q", "-f", filter.as_str()], &[]).await {
            Ok(out) => !out.trim().is_empty(),
            Err(e) => {
                warn!(error = %e, "docker ps failed");
                false
            }
        }
    }

    async fn probe_dimensions(&mut self) {
        let geometry = self.xdotool("getdisplaygeometry").await;
        match parse_geometry(&geometry) {
            Some(dims) => self.dimensions = dims,
            None => warn!(output = geometry.trim(), "could not read display geometry, keeping {:?}", self.dimensions),
        }
    }

    fn compose_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("VNC_PORT", self.vnc_port.map(|p| p.to_string()).unwrap_or_default()),
            ("NOVNC_PORT", self.novnc_port.map(|p| p.to_string()).unwrap_or_default()),
            ("DISPLAY_NUM", self.cfg.display.replace(':', "")),
        ]
    }

    async fn xdotool(&self, args: &str) -> String {
        self.channel
            .exec(&format!("DISPLAY={} xdotool {args}", self.cfg.display))
            .await
    }
}

/// Scoped use of a started [`DockerComputer`]; dropping it returns the computer to `Ready`.
pub struct Session<'a, Ch: CommandChannel> {
    computer: &'a mut DockerComputer<Ch>,
}

impl<Ch: CommandChannel> Deref for Session<'_, Ch> {
    type Target = DockerComputer<Ch>;

    fn deref(&self) -> &Self::Target {
        &*self.computer
    }
}

impl<Ch: CommandChannel> Drop for Session<'_, Ch> {
    fn drop(&mut self) {
        if self.computer.state == SessionState::InUse {
            self.computer.state = SessionState::Ready;
        }
    }
}

#[async_trait]
impl<Ch: CommandChannel> Computer for DockerComputer<Ch> {
    fn environment(&self) -> Environment {
        Environment::Linux
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    async fn screenshot(&self) -> Result<String, AgentError> {
        let cmd = format!("export DISPLAY={} && import -window root png:- | base64 -w 0", self.cfg.display);
        let shot = self.channel.exec(&cmd).await.trim().to_string();
        if shot.is_empty() {
            warn!("screenshot capture returned nothing");
        }
        Ok(shot)
    }

    async fn click(&self, x: i64, y: i64, button: &str) -> Result<(), AgentError> {
        self.xdotool(&format!("mousemove {x} {y} click {}", button_number(button))).await;
        Ok(())
    }

    async fn double_click(&self, x: i64, y: i64) -> Result<(), AgentError> {
        self.xdotool(&format!("mousemove {x} {y} click --repeat 2 1")).await;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), AgentError> {
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                self.xdotool("key Return").await;
                sleep(self.cfg.type_delay).await;
            }
            if !line.is_empty() {
                self.xdotool(&format!("type -- {}", shell_quote(line))).await;
                sleep(self.cfg.type_delay).await;
            }
        }
        Ok(())
    }

    async fn keypress(&self, keys: &[String]) -> Result<(), AgentError> {
        self.xdotool(&format!("key {}", key_chord(keys))).await;
        Ok(())
    }

    // Horizontal scroll is not enacted; only scroll_y turns into wheel clicks.
    async fn scroll(&self, x: i64, y: i64, _scroll_x: i64, scroll_y: i64) -> Result<(), AgentError> {
        self.xdotool(&format!("mousemove {x} {y}")).await;
        let button = if scroll_y < 0 { 4 } else { 5 };
        for _ in 0..scroll_y.unsigned_abs() {
            self.xdotool(&format!("click {button}")).await;
        }
        Ok(())
    }

    async fn drag(&self, path: &[Point]) -> Result<(), AgentError> {
        let Some((start, rest)) = path.split_first() else {
            return Ok(());
        };
        self.xdotool(&format!("mousemove {} {} mousedown 1", start.x, start.y)).await;
        for p in rest {
            self.xdotool(&format!("mousemove {} {}", p.x, p.y)).await;
        }
        self.xdotool("mouseup 1").await;
        Ok(())
    }

    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), AgentError> {
        self.xdotool(&format!("mousemove {x} {y}")).await;
        Ok(())
    }
}

/// Reserves the first localhost port at or above `preferred` that is neither
/// listening nor already handed out in this process. Falls back to the last
/// probed port if none is free. Give it back with [`release_port`].
pub async fn find_available_port(preferred: u16) -> u16 {
    let mut reserved = RESERVED_PORTS.lock().await;
    let mut port = preferred;
    for attempt in 0..PORT_PROBE_ATTEMPTS {
        port = preferred.saturating_add(attempt);
        if reserved.contains(&port) {
            debug!(port, "port reserved by another driver, probing next");
            continue;
        }
        let in_use = matches!(
            timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        );
        if !in_use {
            reserved.insert(port);
            return port;
        }
        debug!(port, "port in use, probing next");
    }
    warn!(preferred, port, "no free port found, using last probed");
    reserved.insert(port);
    port
}

pub async fn release_port(port: u16) {
    RESERVED_PORTS.lock().await.remove(&port);
}

/// Logical key name to X keysym; unknown names pass through unchanged.
pub fn map_key(name: &str) -> &str {
    match name.to_ascii_uppercase().as_str() {
        "ENTER" => "Return",
        "LEFT" => "Left",
        "RIGHT" => "Right",
        "UP" => "Up",
        "DOWN" => "Down",
        "ESC" | "ESCAPE" => "Escape",
        "SPACE" => "space",
        "BACKSPACE" => "BackSpace",
        "TAB" => "Tab",
        "CTRL" | "CONTROL" => "ctrl",
        "ALT" | "OPTION" => "alt",
        "SHIFT" => "shift",
        "SUPER" | "WIN" | "CMD" => "super",
        "META" => "meta",
        "DELETE" => "Delete",
        "HOME" => "Home",
        "END" => "End",
        "PAGEUP" => "Page_Up",
        "PAGEDOWN" => "Page_Down",
        _ => name,
    }
}

pub fn key_chord(keys: &[String]) -> String {
    keys.iter().map(|k| map_key(k)).collect::<Vec<_>>().join("+")
}

fn button_number(button: &str) -> u8 {
    match button {
        "middle" => 2,
        "right" => 3,
        _ => 1,
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn parse_geometry(out: &str) -> Option<(u32, u32)> {
    let mut parts = out.split_whitespace();
    let w = parts.next()?.parse().ok()?;
    let h = parts.next()?.parse().ok()?;
    Some((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeChannel {
        running: AtomicBool,
        fail_compose: bool,
        never_runs: bool,
        health: Option<String>,
        geometry: String,
        screenshot: String,
        execs: StdMutex<Vec<String>>,
        hosts: StdMutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FakeChannel {
        fn execs(&self) -> Vec<String> {
            self.execs.lock().unwrap().clone()
        }
        fn hosts(&self) -> Vec<String> {
            self.hosts.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }
    }

    #[async_trait]
    impl CommandChannel for FakeChannel {
        async fn exec(&self, cmd: &str) -> String {
            self.execs.lock().unwrap().push(cmd.to_string());
            if cmd.contains("getdisplaygeometry") {
                self.geometry.clone()
            } else if cmd.contains("import -window root") {
                self.screenshot.clone()
            } else {
                String::new()
            }
        }

        async fn host(&self, program: &str, args: &[&str], env: &[(&str, String)]) -> anyhow::Result<String> {
            let line = format!("{program} {}", args.join(" "));
            let env = env.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
            self.hosts.lock().unwrap().push((line, env));
            match (program, args.first().copied()) {
                ("docker", Some("ps")) if self.never_runs => Ok(String::new()),
                ("docker", Some("ps")) => Ok(if self.running.load(Ordering::SeqCst) { "abc123\n".into() } else { String::new() }),
                ("docker", Some("inspect")) => Ok(self.health.clone().unwrap_or_else(|| "healthy\n".into())),
                ("docker-compose", _) if self.fail_compose => bail!("compose exploded"),
                ("docker-compose", _) => {
                    let up = args.contains(&"up");
                    self.running.store(up, Ordering::SeqCst);
                    Ok(String::new())
                }
                _ => Ok(String::new()),
            }
        }
    }

    fn cfg() -> DockerConfig {
        DockerConfig {
            container_name: "vnc-desktop".into(),
            display: ":99".into(),
            vnc_port: Some(5900),
            novnc_port: Some(6080),
            compose_file: "docker-compose.yml".into(),
            compose_project: "computer-user-agent".into(),
            shutdown_on_exit: false,
            fallback_dimensions: (1280, 720),
            health_attempts: 3,
            health_backoff: Duration::ZERO,
            startup_grace: Duration::ZERO,
            type_delay: Duration::ZERO,
        }
    }

    fn computer(channel: FakeChannel) -> DockerComputer<FakeChannel> {
        DockerComputer::with_channel(cfg(), channel)
    }

    fn x(args: &str) -> String {
        format!("DISPLAY=:99 xdotool {args}")
    }

    #[test]
    fn key_mapping_is_idempotent_and_passes_unknown_names() {
        for name in ["ENTER", "ESC", "CTRL", "PAGEDOWN", "WIN", "a", "F5", "Return", "ctrl"] {
            let once = map_key(name);
            assert_eq!(map_key(once), once, "{name}");
        }
        assert_eq!(map_key("ENTER"), "Return");
        assert_eq!(map_key("enter"), "Return");
        assert_eq!(map_key("F5"), "F5");
        assert_eq!(map_key("a"), "a");
        assert_eq!(key_chord(&["CTRL".into(), "SHIFT".into(), "t".into()]), "ctrl+shift+t");
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(parse_geometry("1920 1080\n"), Some((1920, 1080)));
        assert_eq!(parse_geometry("garbage"), None);
    }

    #[tokio::test]
    async fn multiline_text_injects_return_between_lines() {
        let c = computer(FakeChannel::default());
        c.type_text("echo 'hi'\n\nls").await.unwrap();
        assert_eq!(
            c.channel.execs(),
            vec![
                x(r"type -- 'echo '\''hi'\'''"),
                x("key Return"),
                x("key Return"),
                x("type -- 'ls'"),
            ]
        );
    }

    #[tokio::test]
    async fn scroll_translates_to_wheel_clicks() {
        let c = computer(FakeChannel::default());
        c.scroll(5, 5, 7, -3).await.unwrap();
        assert_eq!(c.channel.execs(), vec![x("mousemove 5 5"), x("click 4"), x("click 4"), x("click 4")]);

        let c = computer(FakeChannel::default());
        c.scroll(5, 5, 0, 2).await.unwrap();
        assert_eq!(c.channel.execs(), vec![x("mousemove 5 5"), x("click 5"), x("click 5")]);
    }

    #[tokio::test]
    async fn drag_presses_moves_and_releases_in_order() {
        let c = computer(FakeChannel::default());
        let path = [Point { x: 0, y: 0 }, Point { x: 10, y: 10 }, Point { x: 20, y: 5 }];
        c.drag(&path).await.unwrap();
        assert_eq!(
            c.channel.execs(),
            vec![x("mousemove 0 0 mousedown 1"), x("mousemove 10 10"), x("mousemove 20 5"), x("mouseup 1")]
        );
    }

    #[tokio::test]
    async fn clicks_keys_and_moves() {
        let c = computer(FakeChannel::default());
        c.click(1, 2, "right").await.unwrap();
        c.click(1, 2, "back").await.unwrap();
        c.double_click(3, 4).await.unwrap();
        c.keypress(&["CTRL".into(), "a".into()]).await.unwrap();
        c.move_mouse(9, 9).await.unwrap();
        assert_eq!(
            c.channel.execs(),
            vec![
                x("mousemove 1 2 click 3"),
                x("mousemove 1 2 click 1"),
                x("mousemove 3 4 click --repeat 2 1"),
                x("key ctrl+a"),
                x("mousemove 9 9"),
            ]
        );
    }

    #[tokio::test]
    async fn screenshot_failure_degrades_to_empty() {
        let c = computer(FakeChannel::default());
        assert_eq!(c.screenshot().await.unwrap(), "");

        let c = computer(FakeChannel { screenshot: "iVBORw0KGgo=\n".into(), ..Default::default() });
        assert_eq!(c.screenshot().await.unwrap(), "iVBORw0KGgo=");
    }

    #[tokio::test]
    async fn enter_launches_container_and_probes_geometry() {
        let mut c = computer(FakeChannel { geometry: "1920 1080\n".into(), ..Default::default() });
        assert_eq!(c.state(), SessionState::Uninitialized);
        c.enter().await.unwrap();

        assert_eq!(c.state(), SessionState::Ready);
        assert_eq!(c.dimensions(), (1920, 1080));
        let hosts = c.channel.hosts();
        assert_eq!(hosts[0], "docker ps -q -f name=vnc-desktop");
        assert_eq!(hosts[1], "docker-compose -f docker-compose.yml -p computer-user-agent up -d --build");
        assert_eq!(hosts[2], "docker inspect --format {{.State.Health.Status}} vnc-desktop");
        assert_eq!(hosts[3], "docker ps -q -f name=vnc-desktop");
        let env = &c.channel.hosts.lock().unwrap()[1].1;
        assert!(env.contains(&("VNC_PORT".into(), "5900".into())));
        assert!(env.contains(&("NOVNC_PORT".into(), "6080".into())));
        assert!(env.contains(&("DISPLAY_NUM".into(), "99".into())));
        assert_eq!(
            c.vnc_url().as_deref(),
            Some("http://localhost:6080/vnc.html?autoconnect=true&password=secret&resize=local")
        );
    }

    #[tokio::test]
    async fn running_container_is_reused_and_left_running() {
        let channel = FakeChannel { geometry: "bogus".into(), ..Default::default() };
        channel.running.store(true, Ordering::SeqCst);
        let mut c = computer(channel);
        {
            let session = c.acquire().await.unwrap();
            assert_eq!(session.state(), SessionState::InUse);
            assert_eq!(session.dimensions(), (1280, 720));
        }
        assert_eq!(c.state(), SessionState::Ready);
        assert!(!c.channel.hosts().iter().any(|h| h.starts_with("docker-compose")));

        c.exit().await.unwrap();
        assert_eq!(c.state(), SessionState::Stopped);
        assert!(!c.channel.hosts().iter().any(|h| h.contains("down")));
    }

    #[tokio::test]
    async fn shutdown_on_exit_tears_down_what_we_started() {
        let mut cfg = cfg();
        cfg.shutdown_on_exit = true;
        let mut c = DockerComputer::with_channel(cfg, FakeChannel::default());
        c.enter().await.unwrap();
        c.exit().await.unwrap();
        assert_eq!(
            c.channel.hosts().last().map(String::as_str),
            Some("docker-compose -f docker-compose.yml -p computer-user-agent down")
        );
    }

    #[tokio::test]
    async fn provisioning_failures_are_reported() {
        let mut c = computer(FakeChannel { fail_compose: true, ..Default::default() });
        let err = c.enter().await.unwrap_err();
        assert!(matches!(err, AgentError::Provisioning(_)));
        assert!(err.to_string().contains("compose exploded"));
        assert_eq!(c.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn exhausted_health_checks_proceed_optimistically() {
        let mut c = computer(FakeChannel { health: Some("starting\n".into()), ..Default::default() });
        c.enter().await.unwrap();

        assert_eq!(c.state(), SessionState::Ready);
        let inspections = c.channel.hosts().iter().filter(|h| h.starts_with("docker inspect")).count();
        assert_eq!(inspections, 3);
    }

    #[tokio::test]
    async fn container_missing_after_start_points_at_its_logs() {
        let mut c = computer(FakeChannel { never_runs: true, ..Default::default() });
        let err = c.enter().await.unwrap_err();

        assert!(matches!(err, AgentError::Provisioning(_)));
        assert!(err.to_string().contains("docker logs vnc-desktop"), "{err}");
        assert_eq!(c.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn occupied_port_moves_to_next_free_one() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = listener.local_addr().unwrap().port();
        let port = find_available_port(taken).await;
        assert_ne!(port, taken);
        assert!(port > taken && port < taken + PORT_PROBE_ATTEMPTS);
        release_port(port).await;
        // nothing new was bound in between, so the probe converges on the same port
        assert_eq!(find_available_port(taken).await, port);
        release_port(port).await;
    }

    #[tokio::test]
    async fn concurrent_drivers_never_share_a_port() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);

        let (a, b) = tokio::join!(find_available_port(base), find_available_port(base));
        assert_ne!(a, b);
        assert!(a >= base && b >= base);

        release_port(a).await;
        release_port(b).await;
        let again = find_available_port(base).await;
        assert_eq!(again, a.min(b));
        release_port(again).await;
    }

    #[tokio::test]
    async fn exit_returns_probed_ports() {
        let mut cfg = cfg();
        cfg.vnc_port = None;
        cfg.novnc_port = None;
        let channel = FakeChannel::default();
        channel.running.store(true, Ordering::SeqCst);
        let mut c = DockerComputer::with_channel(cfg, channel);
        c.enter().await.unwrap();
        let (vnc, novnc) = c.ports();
        let (vnc, novnc) = (vnc.unwrap(), novnc.unwrap());
        assert!(RESERVED_PORTS.lock().await.contains(&vnc));
        assert!(RESERVED_PORTS.lock().await.contains(&novnc));

        c.exit().await.unwrap();
        let reserved = RESERVED_PORTS.lock().await;
        assert!(!reserved.contains(&vnc) && !reserved.contains(&novnc));
    }
}
