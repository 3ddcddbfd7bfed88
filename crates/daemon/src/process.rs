//! Tool server process lifecycle
//!
//! Long-lived tool servers are spawned with piped stdio and spoken to with the
//! line protocol from [`testrig_common::protocol`]. Each tracked process owns:
//!
//! - a stdout reader task feeding a line channel (the only stdout consumer)
//! - a stderr reader task (logged, never protocol)
//! - an exit watcher that owns the `Child`
//! - a health check task on its own interval
//!
//! Unexpected exits and failed health checks go through one recovery path:
//! restart immediately while the restart budget lasts, otherwise drop the
//! handle and emit [`ServerEvent::RestartBudgetExhausted`].

use crate::config::ProcessConfig;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use testrig_common::protocol::{decode_line, Line, Request};
use testrig_common::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Environment variable carrying the process id into the spawned server
pub const SERVER_ID_ENV: &str = "TESTRIG_SERVER_ID";

/// Unread stdout lines kept per process
const LINE_BUFFER: usize = 1024;

const EVENT_CAPACITY: usize = 64;

/// How long to wait for the exit after SIGKILL before giving up on a process
const KILL_WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Configuration and public snapshots
// ============================================================================

/// How to spawn and supervise one tool server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Logical name; at most one live process per name
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Stdout marker that signals readiness. Without one the server is ready once spawned.
    pub ready_line: Option<String>,
    pub startup_timeout: Duration,
    pub max_restarts: u32,
    pub health_check_interval: Duration,
    pub inactivity_threshold: Option<Duration>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            ready_line: None,
            startup_timeout: Duration::from_secs(10),
            max_restarts: 3,
            health_check_interval: Duration::from_secs(30),
            inactivity_threshold: None,
        }
    }

    /// Take supervision settings from the daemon configuration
    pub fn with_process_config(mut self, config: &ProcessConfig) -> Self {
        self.startup_timeout = config.startup_timeout();
        self.max_restarts = config.max_restarts;
        self.health_check_interval = config.health_check_interval();
        self.inactivity_threshold = config.inactivity_threshold();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn ready_line(mut self, marker: impl Into<String>) -> Self {
        self.ready_line = Some(marker.into());
        self
    }

    pub fn max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }
}

/// Read-only view of a tracked process
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub healthy: bool,
    pub running: bool,
    pub restart_count: u32,
    pub max_restarts: u32,
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Started { id: String, name: String, pid: u32 },
    Stopped { id: String, name: String },
    Exited { id: String, name: String, code: Option<i32> },
    Restarting { id: String, name: String, attempt: u32 },
    Unhealthy { id: String, name: String, reason: String },
    RestartBudgetExhausted { id: String, name: String, restarts: u32 },
}

/// Process counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub total: usize,
    pub healthy: usize,
}

// ============================================================================
// Registry entries
// ============================================================================

/// Request/response side of a server's stdio
struct CallChannel {
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
}

/// A tracked server process
struct ManagedProcess {
    id: String,
    pid: u32,
    config: ServerConfig,
    started_at: DateTime<Utc>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    healthy: bool,
    restart_count: u32,
    /// Set before an intentional stop so the exit watcher does not recover
    stopping: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
    channel: Arc<tokio::sync::Mutex<CallChannel>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    fn is_running(&self) -> bool {
        !*self.exited.borrow()
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.id.clone(),
            name: self.config.name.clone(),
            pid: self.pid,
            started_at: self.started_at,
            last_activity: *self.last_activity.lock(),
            healthy: self.healthy,
            running: self.is_running(),
            restart_count: self.restart_count,
            max_restarts: self.config.max_restarts,
        }
    }
}

struct Inner {
    processes: RwLock<HashMap<String, ManagedProcess>>,
    events: broadcast::Sender<ServerEvent>,
    /// Serializes starts so two callers cannot launch the same name
    start_lock: tokio::sync::Mutex<()>,
    call_timeout: Duration,
    stop_grace: Duration,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Aborting the exit watchers drops their `Child`, which kills the process
        for process in self.processes.get_mut().values() {
            for task in &process.tasks {
                task.abort();
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owner of every tool server process. Cheap to clone.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl ProcessManager {
    pub fn new(config: &ProcessConfig) -> Self {
        Self::with_timeouts(config.call_timeout(), config.stop_grace())
    }

    pub fn with_timeouts(call_timeout: Duration, stop_grace: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                processes: RwLock::new(HashMap::new()),
                events,
                start_lock: tokio::sync::Mutex::new(()),
                call_timeout,
                stop_grace,
            }),
        }
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: ServerEvent) {
        trace!("Server event: {:?}", event);
        let _ = self.inner.events.send(event);
    }

    /// Start a server, or return the id of the live server with the same name
    pub async fn start_server(&self, config: ServerConfig) -> Result<String> {
        let _guard = self.inner.start_lock.lock().await;
        if let Some(id) = self.running_server_id(&config.name) {
            debug!("Server {} already running as {}", config.name, id);
            return Ok(id);
        }
        self.launch(config, 0).await
    }

    async fn launch(&self, config: ServerConfig, restart_count: u32) -> Result<String> {
        let id = process_id(&config.name);
        info!(
            "Starting server {}: {} {}",
            config.name,
            config.command,
            config.args.join(" ")
        );

        let start_error = |reason: String| Error::ProcessStart {
            name: config.name.clone(),
            reason,
        };

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .env(SERVER_ID_ENV, &id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| start_error(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| start_error("process exited before its pid was read".to_string()))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(start_error("stdio was not captured".to_string()));
        };

        let last_activity = Arc::new(Mutex::new(Utc::now()));
        let (line_tx, mut lines) = mpsc::channel(LINE_BUFFER);
        let stdout_task = tokio::spawn(read_stdout(
            stdout,
            line_tx,
            last_activity.clone(),
            id.clone(),
        ));
        let stderr_task = tokio::spawn(read_stderr(stderr, last_activity.clone(), id.clone()));

        if let Some(marker) = &config.ready_line {
            let ready =
                tokio::time::timeout(config.startup_timeout, wait_for_marker(&mut lines, marker))
                    .await;
            if !matches!(ready, Ok(true)) {
                stdout_task.abort();
                stderr_task.abort();
                let _ = child.start_kill();
                let _ = child.wait().await;
                let reason = match ready {
                    Ok(_) => format!("exited before printing {:?}", marker),
                    Err(_) => format!(
                        "{:?} not seen within {}ms",
                        marker,
                        config.startup_timeout.as_millis()
                    ),
                };
                return Err(start_error(reason));
            }
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (exit_tx, exited) = watch::channel(false);
        let name = config.name.clone();
        let health_interval = config.health_check_interval;
        let inactivity = config.inactivity_threshold;

        let process = ManagedProcess {
            id: id.clone(),
            pid,
            config,
            started_at: Utc::now(),
            last_activity: last_activity.clone(),
            healthy: true,
            restart_count,
            stopping: stopping.clone(),
            exited,
            channel: Arc::new(tokio::sync::Mutex::new(CallChannel {
                stdin,
                lines,
            })),
            tasks: vec![stdout_task, stderr_task],
        };
        self.inner.processes.write().insert(id.clone(), process);

        info!("Server {} started as {} (pid {})", name, id, pid);
        self.emit(ServerEvent::Started {
            id: id.clone(),
            name: name.clone(),
            pid,
        });

        let weak = Arc::downgrade(&self.inner);
        let watcher = tokio::spawn(watch_exit(
            weak.clone(),
            child,
            id.clone(),
            name,
            stopping,
            exit_tx,
        ));
        let health = tokio::spawn(health_loop(
            weak,
            id.clone(),
            pid,
            health_interval,
            inactivity,
            last_activity,
        ));

        match self.inner.processes.write().get_mut(&id) {
            Some(process) => process.tasks.extend([watcher, health]),
            // Already recovered or stopped
            None => health.abort(),
        }

        Ok(id)
    }

    /// Stop a server: SIGTERM, grace period, SIGKILL.
    ///
    /// Returns `true` for unknown ids. Returns `false` only when the process
    /// survived SIGKILL.
    pub async fn stop_server(&self, id: &str) -> bool {
        let process = self.inner.processes.write().remove(id);
        let Some(process) = process else {
            debug!("Stop requested for unknown server {}", id);
            return true;
        };

        let name = process.config.name.clone();
        let stopped = self.shutdown(process).await;
        info!("Server {} ({}) stopped", name, id);
        self.emit(ServerEvent::Stopped {
            id: id.to_string(),
            name,
        });
        stopped
    }

    /// Stop every tracked server concurrently
    pub async fn stop_all_servers(&self) {
        let ids: Vec<String> = self.inner.processes.read().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} server(s)", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.stop_server(id))).await;
    }

    /// Restart a server, consuming one unit of its restart budget. Returns the new id.
    pub async fn restart_server(&self, id: &str) -> Result<String> {
        let process = {
            let mut processes = self.inner.processes.write();
            let Some(current) = processes.get(id) else {
                return Err(Error::ProcessNotRunning(id.to_string()));
            };
            if current.restart_count >= current.config.max_restarts {
                return Err(Error::RestartBudgetExceeded {
                    name: current.config.name.clone(),
                    max_restarts: current.config.max_restarts,
                });
            }
            processes.remove(id)
        };
        match process {
            Some(process) => self.replace(process).await,
            None => Err(Error::ProcessNotRunning(id.to_string())),
        }
    }

    async fn replace(&self, process: ManagedProcess) -> Result<String> {
        let config = process.config.clone();
        let attempt = process.restart_count + 1;
        info!(
            "Restarting server {} ({}), attempt {}/{}",
            config.name, process.id, attempt, config.max_restarts
        );
        self.emit(ServerEvent::Restarting {
            id: process.id.clone(),
            name: config.name.clone(),
            attempt,
        });
        self.shutdown(process).await;
        self.launch(config, attempt).await
    }

    /// Crash and health failure path. Boxed because it spawns the tasks that call it.
    fn recover(self, id: String) -> BoxFuture<'static, ()> {
        async move { self.recover_inner(id).await }.boxed()
    }

    async fn recover_inner(&self, id: String) {
        let process = self.inner.processes.write().remove(&id);
        let Some(mut process) = process else {
            trace!("Server {} already recovered or stopped", id);
            return;
        };

        if process.restart_count >= process.config.max_restarts {
            error!(
                "Server {} ({}) exhausted its restart budget of {}",
                process.config.name, id, process.config.max_restarts
            );
            process.healthy = false;
            let name = process.config.name.clone();
            let restarts = process.restart_count;
            self.shutdown(process).await;
            self.emit(ServerEvent::RestartBudgetExhausted { id, name, restarts });
            return;
        }

        let name = process.config.name.clone();
        if let Err(e) = self.replace(process).await {
            error!("Failed to restart server {}: {}", name, e);
        }
    }

    /// Terminate a removed entry and release its tasks. Returns `false` if the
    /// process could not be confirmed dead.
    async fn shutdown(&self, process: ManagedProcess) -> bool {
        process.stopping.store(true, Ordering::SeqCst);
        let mut exited = process.exited.clone();

        let mut stopped = true;
        if process.is_running() {
            let pid = Pid::from_raw(process.pid as i32);
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", process.id, e);
            }
            if !wait_exited(&mut exited, self.inner.stop_grace).await {
                warn!("Server {} ignored SIGTERM, sending SIGKILL", process.id);
                let _ = kill(pid, Signal::SIGKILL);
                if !wait_exited(&mut exited, KILL_WAIT).await {
                    error!(
                        "Server {} (pid {}) still alive after SIGKILL, abandoning it",
                        process.id, process.pid
                    );
                    stopped = false;
                }
            }
        }

        for task in &process.tasks {
            task.abort();
        }
        stopped
    }

    /// Send one request and wait for its response.
    ///
    /// Calls to the same process are serialized. Lines left over from
    /// earlier calls are discarded before the request is written.
    pub async fn execute_command(&self, id: &str, method: &str, params: Value) -> Result<Value> {
        let channel = {
            let processes = self.inner.processes.read();
            match processes.get(id) {
                Some(process) if process.is_running() => process.channel.clone(),
                _ => return Err(Error::ProcessNotRunning(id.to_string())),
            }
        };

        let mut channel = channel.lock().await;
        let mut stale = 0;
        while channel.lines.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} stale line(s) from {}", stale, id);
        }

        let request = Request::new(method, params).to_line()?;
        trace!("-> {}: {}", id, request.trim_end());
        let write = async {
            channel.stdin.write_all(request.as_bytes()).await?;
            channel.stdin.flush().await
        };
        if let Err(e) = write.await {
            warn!("Failed to write to server {}: {}", id, e);
            return Err(Error::ProcessNotRunning(id.to_string()));
        }

        let timeout = self.inner.call_timeout;
        let response = tokio::time::timeout(timeout, async {
            while let Some(line) = channel.lines.recv().await {
                match decode_line(&line) {
                    Line::Noise => trace!("Skipping non-protocol line from {}", id),
                    Line::Response(result) => return result,
                }
            }
            Err(Error::ProcessNotRunning(id.to_string()))
        })
        .await;

        match response {
            Ok(result) => result,
            Err(_) => {
                warn!("Call {} on {} timed out after {:?}", method, id, timeout);
                Err(Error::ProcessCallTimeout {
                    method: method.to_string(),
                    millis: timeout.as_millis() as u64,
                })
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_server_status(&self, id: &str) -> Option<ServerStatus> {
        self.inner.processes.read().get(id).map(ManagedProcess::status)
    }

    pub fn get_all_server_statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .inner
            .processes
            .read()
            .values()
            .map(ManagedProcess::status)
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Whether a live process with this logical name exists
    pub fn is_server_running(&self, name: &str) -> bool {
        self.running_server_id(name).is_some()
    }

    /// Id of the live process with this logical name
    pub fn running_server_id(&self, name: &str) -> Option<String> {
        self.inner
            .processes
            .read()
            .values()
            .find(|p| p.config.name == name && p.is_running())
            .map(|p| p.id.clone())
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        let processes = self.inner.processes.read();
        ResourceUsage {
            total: processes.len(),
            healthy: processes.values().filter(|p| p.healthy).count(),
        }
    }

    /// Flag a process unhealthy. Returns `false` if it is no longer tracked.
    fn mark_unhealthy(&self, id: &str) -> bool {
        match self.inner.processes.write().get_mut(id) {
            Some(process) => {
                process.healthy = false;
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Per-process tasks
// ============================================================================

fn process_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", name, Utc::now().timestamp_millis(), &suffix[..8])
}

async fn wait_exited(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    // A dropped sender means the watcher is gone along with its child
    tokio::time::timeout(limit, exited.wait_for(|done| *done))
        .await
        .is_ok()
}

async fn wait_for_marker(lines: &mut mpsc::Receiver<String>, marker: &str) -> bool {
    while let Some(line) = lines.recv().await {
        if line.contains(marker) {
            return true;
        }
    }
    false
}

async fn read_stdout(
    stdout: ChildStdout,
    lines: mpsc::Sender<String>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    id: String,
) {
    let mut reader = BufReader::new(stdout).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                *last_activity.lock() = Utc::now();
                trace!("<- {}: {}", id, line);
                match lines.try_send(line) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Line buffer of {} is full, dropping output", id)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Ok(None) => {
                debug!("Stdout of {} closed", id);
                break;
            }
            Err(e) => {
                warn!("Error reading stdout of {}: {}", id, e);
                break;
            }
        }
    }
}

async fn read_stderr(
    stderr: ChildStderr,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
    id: String,
) {
    let mut reader = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        *last_activity.lock() = Utc::now();
        debug!("[{} stderr] {}", id, line);
    }
}

async fn watch_exit(
    inner: Weak<Inner>,
    mut child: Child,
    id: String,
    name: String,
    stopping: Arc<AtomicBool>,
    exit_tx: watch::Sender<bool>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to wait on server {}: {}", id, e);
            None
        }
    };
    let _ = exit_tx.send(true);

    if stopping.load(Ordering::SeqCst) {
        debug!("Server {} exited after stop request", id);
        return;
    }
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let manager = ProcessManager { inner };

    warn!("Server {} ({}) exited unexpectedly with code {:?}", name, id, code);
    manager.emit(ServerEvent::Exited {
        id: id.clone(),
        name,
        code,
    });
    tokio::spawn(manager.recover(id));
}

async fn health_loop(
    inner: Weak<Inner>,
    id: String,
    pid: u32,
    every: Duration,
    inactivity: Option<Duration>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if inner.strong_count() == 0 {
            return;
        }

        let reason = if kill(Pid::from_raw(pid as i32), None).is_err() {
            Some("process is not alive".to_string())
        } else if let Some(limit) = inactivity {
            let idle = (Utc::now() - *last_activity.lock())
                .to_std()
                .unwrap_or_default();
            (idle > limit).then(|| format!("no output for {}s", idle.as_secs()))
        } else {
            None
        };

        let Some(reason) = reason else {
            trace!("Server {} healthy", id);
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = ProcessManager { inner };
        if !manager.mark_unhealthy(&id) {
            return;
        }

        let name = manager
            .get_server_status(&id)
            .map(|s| s.name)
            .unwrap_or_default();
        warn!("Server {} ({}) failed health check: {}", name, id, reason);
        manager.emit(ServerEvent::Unhealthy {
            id: id.clone(),
            name,
            reason,
        });
        tokio::spawn(manager.recover(id));
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_format() {
        let id = process_id("k6");
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2], "k6");
        assert_ne!(process_id("k6"), process_id("k6"));
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::new("lighthouse", "node")
            .args(["lighthouse_server.js"])
            .env("LIGHTHOUSE_BIN", "npx lighthouse")
            .cwd("/srv/mcp")
            .ready_line("listening")
            .with_process_config(&ProcessConfig {
                max_restarts: 9,
                inactivity_threshold_secs: Some(120),
                ..Default::default()
            });
        assert_eq!(config.args, vec!["lighthouse_server.js"]);
        assert_eq!(config.max_restarts, 9);
        assert_eq!(config.inactivity_threshold, Some(Duration::from_secs(120)));
        assert_eq!(config.ready_line.as_deref(), Some("listening"));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let manager = ProcessManager::new(&ProcessConfig::default());
        assert!(manager.stop_server("nope").await);
        assert!(manager.get_server_status("nope").is_none());
        assert!(matches!(
            manager.execute_command("nope", "ping", Value::Null).await,
            Err(Error::ProcessNotRunning(_))
        ));
        assert!(matches!(
            manager.restart_server("nope").await,
            Err(Error::ProcessNotRunning(_))
        ));
        assert_eq!(manager.resource_usage(), ResourceUsage::default());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let manager = ProcessManager::new(&ProcessConfig::default());
        let result = manager
            .start_server(ServerConfig::new("ghost", "/nonexistent/testrig-tool"))
            .await;
        assert!(matches!(result, Err(Error::ProcessStart { .. })));
        assert!(!manager.is_server_running("ghost"));
    }
}
