//! One-off tool process execution
//!
//! Used by the runners that spawn a tool directly and by the one-shot client.
//! Stdout is streamed line by line, in order, to a callback; stderr is
//! collected on the side. Cancellation sends SIGTERM, waits out a grace
//! period, then sends SIGKILL.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use testrig_common::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to wait for the exit after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(1);

/// How long to wait for stderr to drain after the process is gone
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// A command line to spawn
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to stdin, which is then closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
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
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a finished (or cancelled) process left behind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.cancelled && self.code == Some(0)
    }
}

/// Run a command to completion, handing each stdout line to `on_line`.
///
/// Returns `Err` only when the process cannot be spawned. A nonzero exit or a
/// cancellation is reported in the returned [`ExecOutput`].
pub async fn run_streaming<F>(
    spec: &CommandSpec,
    cancel: &CancellationToken,
    grace: Duration,
    mut on_line: F,
) -> Result<ExecOutput>
where
    F: FnMut(&str) + Send,
{
    debug!("Spawning: {}", spec.display());

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| Error::ProcessStart {
        name: spec.program.clone(),
        reason: e.to_string(),
    })?;

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("Failed to write stdin: {}", e);
            }
            // Dropping stdin closes it
        });
    }

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            if let Err(e) = stderr.read_to_string(&mut buf).await {
                debug!("Failed to read stderr: {}", e);
            }
            buf
        })
    });

    let mut stdout = String::new();
    let mut cancelled = false;

    if let Some(out) = child.stdout.take() {
        let mut lines = BufReader::new(out).lines();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        stdout.push_str(&line);
                        stdout.push('\n');
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Error reading stdout of {}: {}", spec.program, e);
                        break;
                    }
                },
            }
        }
    }

    let code = if cancelled {
        info!("Cancelling {}", spec.program);
        terminate(&mut child, grace).await
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                info!("Cancelling {}", spec.program);
                terminate(&mut child, grace).await
            }
            status = child.wait() => match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait on {}: {}", spec.program, e);
                    None
                }
            },
        }
    };

    let stderr = match stderr_task {
        Some(task) => match tokio::time::timeout(STDERR_DRAIN, task).await {
            Ok(Ok(buf)) => buf,
            _ => String::new(),
        },
        None => String::new(),
    };

    debug!("{} finished with code {:?}", spec.program, code);
    Ok(ExecOutput {
        code,
        stdout,
        stderr,
        cancelled,
    })
}

/// SIGTERM, wait `grace`, then SIGKILL. Returns the exit code if one was observed.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.try_wait().ok().flatten().and_then(|s| s.code());
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status.ok().and_then(|s| s.code());
    }

    warn!("Process {} ignored SIGTERM, sending SIGKILL", pid);
    if let Err(e) = child.start_kill() {
        debug!("SIGKILL to {} failed: {}", pid, e);
    }
    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(status) => status.ok().and_then(|s| s.code()),
        Err(_) => {
            error!("Process {} did not exit after SIGKILL, abandoning it", pid);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_streams_lines_in_order() {
        let mut seen = Vec::new();
        let output = run_streaming(
            &sh("echo one; echo two; echo oops >&2; echo three; exit 3"),
            &CancellationToken::new(),
            Duration::from_secs(1),
            |line| seen.push(line.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(output.stdout, "one\ntwo\nthree\n");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_stdin_and_env() {
        let spec = sh("read line; echo \"$line $GREETING\"")
            .env("GREETING", "world")
            .stdin("hello\n");
        let output = run_streaming(&spec, &CancellationToken::new(), Duration::from_secs(1), |_| {})
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello world\n");
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let output = run_streaming(&sh("echo started; sleep 10"), &cancel, Duration::from_secs(2), |_| {})
            .await
            .unwrap();

        assert!(output.cancelled);
        assert_eq!(output.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_sigkill_after_grace() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let output = run_streaming(
            &sh("trap '' TERM; sleep 10"),
            &cancel,
            Duration::from_millis(200),
            |_| {},
        )
        .await
        .unwrap();

        assert!(output.cancelled);
        assert_eq!(output.code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = run_streaming(
            &CommandSpec::new("/nonexistent/testrig-tool"),
            &CancellationToken::new(),
            Duration::from_secs(1),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(Error::ProcessStart { .. })));
    }
}
